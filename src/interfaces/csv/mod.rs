pub mod history_writer;
