use envconfig::Envconfig;

#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    // We default to "earliest" for this, since a brand new consumer group should
    // fold in whatever history the topic still retains
    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest

    #[envconfig(default = "30000")]
    pub kafka_session_timeout_ms: u32,
}

/// Per-consumer settings. Services run more than one consumer off a single
/// `KafkaConfig`, so this isn't read from the environment directly.
#[derive(Clone, Debug)]
pub struct ConsumerConfig {
    pub group: String,
    pub topic: String,
}

impl ConsumerConfig {
    pub fn new(group: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            topic: topic.into(),
        }
    }
}
