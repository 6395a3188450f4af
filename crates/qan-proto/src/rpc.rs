//! Shared plumbing for the hand-rolled tonic services.

use tonic::body::BoxBody;
use tonic::codec::ProstCodec;
use tonic::codegen::{empty_body, http, Body, StdError};
use tonic::server::{Grpc, UnaryService};

/// Per-service message size limits; `None` keeps tonic's default
/// (4 MiB decoding, unlimited encoding).
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Limits {
    pub(crate) max_decoding: Option<usize>,
    pub(crate) max_encoding: Option<usize>,
}

/// Decode a unary request with prost, run `service`, and encode the reply.
pub(crate) async fn unary<S, Req, Resp, B>(
    service: S,
    req: http::Request<B>,
    limits: Limits,
) -> http::Response<BoxBody>
where
    S: UnaryService<Req, Response = Resp>,
    Req: prost::Message + Default + Send + 'static,
    Resp: prost::Message + Send + 'static,
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    let codec: ProstCodec<Resp, Req> = ProstCodec::default();
    let mut grpc = Grpc::new(codec)
        .apply_max_message_size_config(limits.max_decoding, limits.max_encoding);
    grpc.unary(service, req).await
}

/// Response for a method path that no service registered.
pub(crate) fn unimplemented() -> http::Response<BoxBody> {
    let mut response = http::Response::new(empty_body());
    let headers = response.headers_mut();
    headers.insert(
        "grpc-status",
        http::HeaderValue::from(tonic::Code::Unimplemented as i32),
    );
    headers.insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/grpc"),
    );
    response
}
