pub mod common;
mod task_tests;
