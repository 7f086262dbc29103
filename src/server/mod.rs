pub mod grpc_handler;
pub mod webhook_handler;
