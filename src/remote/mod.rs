//! The network boundary: the HTTP fetch seam, auth token access, and the
//! network-first cached reader built on top of them.

mod cached_client;
mod client;

pub use cached_client::{CachedRemote, ReadError, ReadResult, ReadSource};
pub use client::{
  ApiClient, ApiRequest, ApiResponse, EnvTokenProvider, HttpClient, StaticTokenProvider,
  TokenProvider,
};
