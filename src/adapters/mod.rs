//! Adapters (implementations) behind the port traits: the upstream HTTP
//! client, the request interceptor, the interactive operator prompt and
//! the proxy handler that ties them together.

pub mod http_client;
pub mod http_handler;
pub mod interceptor;
pub mod prompt;

pub use http_client::UpstreamClient;
pub use http_handler::{ProxyHandler, ProxyMode};
pub use interceptor::{InterceptedBody, RequestInterceptor};
pub use prompt::OperatorPrompt;
