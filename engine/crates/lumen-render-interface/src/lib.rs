pub mod bump_allocator;
pub mod command_stream_pool;
pub mod deferred_destroy;
pub mod frame_counter;
pub mod output_settings;
pub mod resource_table;
pub mod stats;
