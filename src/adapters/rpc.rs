//! RPC adapter: maps gRPC-style full method paths onto the same
//! resource-name space the HTTP adapter uses, and classifies outcomes into
//! `RpcRejection`. The `tonic`-shaped interceptor trait is feature-gated so
//! HTTP-only consumers never pull in `tonic`.

use std::time::Instant;

use crate::engine::{Decision, ProtectionEngine, ReportOutcome};

/// `/user.UserService/GetUser` -> `/grpc/user_service/get_user`.
///
/// The gRPC full method path is `/<package>.<Service>/<Method>`; this keeps
/// the two path segments, snake-cases both, and prefixes with `/grpc` so
/// the same pattern language (`/grpc/*/get*`) governs both HTTP and RPC
/// traffic.
pub fn rpc_resource_name(full_method: &str) -> String {
    let trimmed = full_method.trim_start_matches('/');
    let Some((service_part, method_part)) = trimmed.split_once('/') else {
        return format!("/grpc/{}", snake_case(trimmed));
    };
    let service = service_part.rsplit('.').next().unwrap_or(service_part);
    format!("/grpc/{}/{}", snake_case(service), snake_case(method_part))
}

fn snake_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 4);
    for (i, ch) in s.chars().enumerate() {
        if ch.is_uppercase() {
            if i != 0 {
                out.push('_');
            }
            out.extend(ch.to_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcStatusCode {
    ResourceExhausted,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RpcRejection {
    pub code: RpcStatusCode,
    pub message: String,
}

/// Runs `acquire` for `full_method`, returning `Err(RpcRejection)` when the
/// call should be rejected, or `Ok(RpcCall)` carrying what's needed to
/// report the outcome once the real handler has run.
pub fn rpc_acquire(engine: &ProtectionEngine, full_method: &str) -> Result<RpcCall, RpcRejection> {
    let resource = rpc_resource_name(full_method);
    let (decision, handle) = engine.acquire_with_handle(&resource);
    match decision {
        Decision::BlockRateLimit => Err(RpcRejection {
            code: RpcStatusCode::ResourceExhausted,
            message: format!("rate limit exceeded for {resource}"),
        }),
        Decision::BlockCircuitOpen => Err(RpcRejection {
            code: RpcStatusCode::Unavailable,
            message: format!("circuit open for {resource}"),
        }),
        Decision::Admit => Ok(RpcCall {
            handle: handle.expect("Admit decisions always carry a handle"),
            started: Instant::now(),
        }),
    }
}

pub struct RpcCall {
    handle: crate::engine::Handle,
    started: Instant,
}

impl RpcCall {
    /// Reports back to the engine, classifying the gRPC status as
    /// `Success` unless `is_error` is set — callers determine error-ness
    /// from the handler's own `tonic::Status` before calling this.
    pub fn finish(self, engine: &ProtectionEngine, is_error: bool) {
        let outcome = if is_error {
            ReportOutcome::Error
        } else {
            ReportOutcome::Success
        };
        engine.report(&self.handle, outcome, self.started.elapsed());
    }
}

#[cfg(feature = "tonic")]
pub mod tonic_interceptor {
    //! A `tonic::service::Interceptor`-shaped helper. Kept minimal and
    //! feature-gated: full server wiring (extracting the method path from
    //! `tonic::Request`'s extensions) is left to the embedding service,
    //! mirroring how the pack's heavier tonic consumers only pull this
    //! dependency in where gRPC is actually served.
    use std::sync::Arc;

    use tonic::{Request, Status};

    use crate::engine::ProtectionEngine;

    use super::{rpc_acquire, RpcStatusCode};

    pub fn check(engine: &Arc<ProtectionEngine>, full_method: &str, req: Request<()>) -> Result<Request<()>, Status> {
        match rpc_acquire(engine, full_method) {
            Ok(_) => Ok(req),
            Err(rejection) => {
                let code = match rejection.code {
                    RpcStatusCode::ResourceExhausted => tonic::Code::ResourceExhausted,
                    RpcStatusCode::Unavailable => tonic::Code::Unavailable,
                };
                Err(Status::new(code, rejection.message))
            }
        }
    }
}
