pub mod worker_tick;
