use crate::config::AuthConfig;
use crate::repository::Store;
use actix_web::{
    body::EitherBody,
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    Error, HttpMessage, HttpResponse,
};
use futures_util::future::LocalBoxFuture;
use gateway_core::codec::{timestamp_within_window, verify_header, HeaderCheck};
use gateway_core::{Clock, ShortResponse};
use std::future::{ready, Ready};
use std::rc::Rc;
use std::sync::Arc;

pub const HEADER_CLIENT_KEY: &str = "clientkey";
pub const HEADER_SIGNATURE: &str = "signature";
pub const HEADER_TIMESTAMP: &str = "timestamp";

pub const CODE_MISSING_HEADERS: &str = "401400";
pub const CODE_INVALID_SIGNATURE: &str = "401401";
pub const CODE_UNKNOWN_CLIENT: &str = "401402";
pub const CODE_STALE_TIMESTAMP: &str = "401407";

/// Client id that passed header authentication, stored in request extensions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedClient(pub String);

/// Header HMAC authentication for the location endpoints.
///
/// Rejections are answered in-band with HTTP 200.
#[derive(Clone)]
pub struct ClientAuth {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    settings: AuthConfig,
}

impl ClientAuth {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, settings: AuthConfig) -> Self {
        Self { store, clock, settings }
    }
}

impl<S, B> Transform<S, ServiceRequest> for ClientAuth
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type InitError = ();
    type Transform = ClientAuthMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(ClientAuthMiddleware {
            service: Rc::new(service),
            auth: self.clone(),
        }))
    }
}

pub struct ClientAuthMiddleware<S> {
    service: Rc<S>,
    auth: ClientAuth,
}

fn header(req: &ServiceRequest, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn deny<B>(req: ServiceRequest, code: &str, message: &str) -> ServiceResponse<EitherBody<B>> {
    let response = HttpResponse::Ok().json(ShortResponse::new(code, message));
    req.into_response(response).map_into_right_body()
}

impl<S, B> Service<ServiceRequest> for ClientAuthMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = Rc::clone(&self.service);
        let auth = self.auth.clone();

        Box::pin(async move {
            let (Some(client_key), Some(signature), Some(timestamp)) = (
                header(&req, HEADER_CLIENT_KEY),
                header(&req, HEADER_SIGNATURE),
                header(&req, HEADER_TIMESTAMP),
            ) else {
                return Ok(deny(req, CODE_MISSING_HEADERS, "Missing Mandatory Header"));
            };

            if auth.settings.enforce_timestamp_window {
                let window = chrono::Duration::minutes(auth.settings.timestamp_window_minutes);
                if !timestamp_within_window(&timestamp, auth.clock.now(), window) {
                    tracing::warn!(client_key = %client_key, "Header timestamp outside window");
                    return Ok(deny(req, CODE_STALE_TIMESTAMP, "Invalid Timestamp"));
                }
            }

            let secret = match auth.store.client_secret(&client_key).await {
                Ok(secret) => secret,
                Err(e) => {
                    tracing::error!(error = %e, "Client secret lookup failed");
                    let response = HttpResponse::InternalServerError().json(ShortResponse::general_error());
                    return Ok(req.into_response(response).map_into_right_body());
                }
            };

            match verify_header(secret.as_deref(), &client_key, &timestamp, &signature) {
                HeaderCheck::Valid => {
                    req.extensions_mut().insert(AuthenticatedClient(client_key));
                    let res = service.call(req).await?;
                    Ok(res.map_into_left_body())
                }
                HeaderCheck::UnknownClient => {
                    tracing::warn!(client_key = %client_key, "Unknown clientkey");
                    Ok(deny(req, CODE_UNKNOWN_CLIENT, "Invalid Credential"))
                }
                HeaderCheck::InvalidSignature => {
                    tracing::warn!(client_key = %client_key, "Header signature mismatch");
                    Ok(deny(req, CODE_INVALID_SIGNATURE, "Unauthorized Signature"))
                }
            }
        })
    }
}
