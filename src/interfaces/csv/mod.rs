pub mod account_writer;
pub mod request_reader;
pub mod request_writer;
