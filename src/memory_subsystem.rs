pub(crate) mod memory_subsystem;
pub(crate) mod load_store_queue;
