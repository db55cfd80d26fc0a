#![forbid(unsafe_code)]

mod error;
pub use error::{Error, ErrorKind, Result};

mod payload;
pub use payload::Payload;

mod msg;
pub use msg::{MSG_HEADER_SIZE, Message, MsgType};

pub mod driver;

mod client;
pub use client::{ClientConfig, NotificationHandler, RpcClient};

mod server;
pub use server::{CommandExecutor, RpcServer, ServerConfig, ServerHandle};
