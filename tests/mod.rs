mod common;

mod api_tests;
mod postgres_tests;
mod retry_tests;
