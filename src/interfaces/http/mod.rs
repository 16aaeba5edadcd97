pub mod loyalty_client;
