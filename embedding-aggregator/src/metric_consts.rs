pub const MESSAGES_RECEIVED: &str = "embedding_aggregator_messages_received";
pub const MALFORMED_MESSAGES: &str = "embedding_aggregator_malformed_messages";
pub const POLL_FAILURES: &str = "embedding_aggregator_poll_failures";
pub const BATCH_SIZE: &str = "embedding_aggregator_batch_size";
pub const BATCHES_COMMITTED: &str = "embedding_aggregator_batches_committed";
pub const BATCHES_WITHHELD: &str = "embedding_aggregator_batches_withheld";
pub const COMMIT_FAILURES: &str = "embedding_aggregator_commit_failures";
pub const BATCH_TIME: &str = "embedding_aggregator_batch_time";

pub const USER_GROUPS_UPDATED: &str = "embedding_aggregator_user_groups_updated";
pub const USER_GROUPS_SKIPPED: &str = "embedding_aggregator_user_groups_skipped";
pub const USER_GROUPS_FAILED: &str = "embedding_aggregator_user_groups_failed";
pub const UNRESOLVED_CONTENT: &str = "embedding_aggregator_unresolved_content";
pub const CORRUPT_STORED_VECTORS: &str = "embedding_aggregator_corrupt_stored_vectors";

pub const CONTENT_INGESTED: &str = "embedding_aggregator_content_ingested";
pub const CONTENT_SKIPPED: &str = "embedding_aggregator_content_skipped";
pub const CONTENT_FAILED: &str = "embedding_aggregator_content_failed";
pub const CONTENT_ROW_MISSING: &str = "embedding_aggregator_content_row_missing";

pub const VECTOR_INDEX_REQUEST_TIME: &str = "embedding_aggregator_vector_index_request_time";
