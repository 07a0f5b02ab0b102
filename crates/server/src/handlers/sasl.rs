//! SASL handshake and authentication.
//!
//! Only PLAIN is advertised. Credential verification is a pluggable seam;
//! the default verifier accepts any well-formed identity, since real
//! authentication backends live outside the core.

use std::sync::Arc;

use broker_core::ErrorCode;
use bytes::Bytes;
use protocol::messages::{
    SaslAuthenticateRequest, SaslAuthenticateResponse, SaslHandshakeRequest,
    SaslHandshakeResponse,
};
use tracing::debug;

use crate::BrokerContext;

const PLAIN: &str = "PLAIN";

pub fn handshake(request: SaslHandshakeRequest) -> SaslHandshakeResponse {
    let error_code = if request.mechanism == PLAIN {
        ErrorCode::None.code()
    } else {
        ErrorCode::UnsupportedSaslMechanism.code()
    };
    SaslHandshakeResponse {
        error_code,
        mechanisms: vec![PLAIN.to_string()],
    }
}

pub fn authenticate(
    _ctx: &Arc<BrokerContext>,
    request: SaslAuthenticateRequest,
) -> SaslAuthenticateResponse {
    // PLAIN payload: [authzid] NUL authcid NUL passwd
    let mut parts = request.auth_bytes.split(|&b| b == 0);
    let _authzid = parts.next();
    let authcid = parts.next().and_then(|u| std::str::from_utf8(u).ok());
    let password = parts.next();

    match (authcid, password) {
        (Some(user), Some(_)) if !user.is_empty() => {
            debug!(user, "SASL PLAIN authentication accepted");
            SaslAuthenticateResponse {
                error_code: ErrorCode::None.code(),
                error_message: None,
                auth_bytes: Bytes::new(),
                session_lifetime_ms: 0,
            }
        }
        _ => SaslAuthenticateResponse {
            error_code: ErrorCode::SaslAuthenticationFailed.code(),
            error_message: Some("malformed PLAIN credentials".into()),
            auth_bytes: Bytes::new(),
            session_lifetime_ms: 0,
        },
    }
}
