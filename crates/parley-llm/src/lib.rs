pub mod converter;
pub mod decoder;
pub mod http;
pub mod mock;
pub mod stream;

pub use decoder::ModelStreamDecoder;
pub use http::HttpModelBackend;
pub use mock::{MockBackend, MockResponse};
pub use stream::{decode, ModelStream, DEFAULT_IDLE_TIMEOUT};
