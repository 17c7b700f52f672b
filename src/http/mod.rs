//! # HTTP Collaborator
//!
//! The client contract test bodies use to reach the server under test, its
//! reqwest implementation, the side-channel REST client, and the captured
//! request/response records attached to test results.

pub mod client;
pub mod exchange;
pub mod logged;
pub mod method;
pub mod reply;
pub mod request;
pub mod response;

pub use client::{DetachedClient, FhirClient, RestFhirClient};
pub use exchange::{CapturedExchange, Direction, InboundRequest, RecordedExchange};
pub use logged::{DetachedTransport, LoggedRestClient, ReqwestTransport, RestTransport};
pub use method::HttpMethod;
pub use reply::Reply;
pub use request::RequestRecord;
pub use response::ResponseRecord;
