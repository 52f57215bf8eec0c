pub mod client;

pub use client::{
    HttpUpstream, Upstream, UpstreamBody, UpstreamError, UpstreamRequest, UpstreamResponse,
    extract_balance,
};
