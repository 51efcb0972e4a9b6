pub mod bots;
