pub mod url;
pub use url::{UrlNormalizeError, normalize_server_url};
