mod error;
pub use error::*;

mod config;
pub use config::*;

mod crypto;
pub use crypto::*;

mod short_code;
pub use short_code::*;

mod messages;
pub use messages::*;

mod qrcode;
pub use qrcode::*;

mod store;
pub use store::*;

mod transport;
pub use transport::*;

mod transaction;
pub use transaction::*;

mod request;
pub use request::*;

mod service;
pub use service::*;

mod logging;
pub use logging::init_tracing;
