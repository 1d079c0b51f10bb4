pub mod backlog_counter;
pub mod batch_processor;
