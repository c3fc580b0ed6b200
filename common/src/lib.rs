use owo_colors::OwoColorize;
use rustls::pki_types::CertificateDer;
use rustls::{ClientConfig, RootCertStore};
use tokio_postgres_rustls::MakeRustlsConnect;

use anyhow::Result;

pub mod args;
pub mod error;
pub mod metrics;
pub mod postgres;
pub mod redis;
mod request_context;
pub mod shutdown;
pub mod wait;

pub use request_context::*;

/// Redis topic carrying ids of actions that just became READY. Engines
/// subscribe to it so idle workers wake up without waiting out the
/// periodic poll interval.
pub const READY_TOPIC: &str = "drover.actions.ready";

pub fn signal_ready() {
    std::fs::write("/etc/ready", "ready").expect("Failed to write readiness file");
}

pub fn init() {
    let disable_colors = ["1", "true"].contains(
        &std::env::var("DISABLE_COLORS")
            .unwrap_or_else(|_| String::new())
            .to_lowercase()
            .as_str(),
    );
    owo_colors::set_override(!disable_colors);

    install_rustls_provider();
}

pub fn install_rustls_provider() {
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("install aws-lc-rs provider");
}

pub fn make_rustls(certs: Vec<CertificateDer<'_>>) -> Result<MakeRustlsConnect> {
    let mut roots = RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().expect("could not load platform certs") {
        roots.add(cert).unwrap();
    }
    for cert in certs {
        roots.add(cert)?;
    }
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(MakeRustlsConnect::new(config))
}

/// Fault wrapper used by the API layer: turns the engine's error taxonomy
/// into a parsable JSON response with the right status code.
pub mod response {
    use axum::http::StatusCode;
    use axum::response::{IntoResponse, Response};
    use axum::Json;
    use owo_colors::OwoColorize;

    use crate::error::Error;

    pub fn status_for(e: &Error) -> StatusCode {
        match e {
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::Invalid(_) => StatusCode::BAD_REQUEST,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::ActionInProgress { .. } => StatusCode::CONFLICT,
            Error::NotSupported(_) => StatusCode::BAD_REQUEST,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn print_error(e: &Error) {
        eprintln!(
            "❌ {}",
            format!("{:?}", e)
                .split('\n')
                .map(|s| s.red().to_string())
                .collect::<Vec<_>>()
                .join("\n"),
        );
    }

    pub fn fault(e: Error) -> Response {
        let code = status_for(&e);
        let reason = format!("{}", e);
        print_error(&e);
        (
            code,
            Json(serde_json::json!({
                "error": { "type": e.tag(), "message": reason },
            })),
        )
            .into_response()
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use uuid::Uuid;

        #[test]
        fn taxonomy_maps_to_expected_codes() {
            assert_eq!(
                status_for(&Error::not_found("cluster", Uuid::nil())),
                StatusCode::NOT_FOUND
            );
            assert_eq!(
                status_for(&Error::Invalid("bad".into())),
                StatusCode::BAD_REQUEST
            );
            assert_eq!(
                status_for(&Error::Forbidden("no".into())),
                StatusCode::FORBIDDEN
            );
            assert_eq!(
                status_for(&Error::ActionInProgress {
                    target_type: "cluster",
                    target: Uuid::nil(),
                    current: "CLUSTER_UPDATE".into(),
                }),
                StatusCode::CONFLICT
            );
            assert_eq!(
                status_for(&Error::NotSupported("lists on both sides".into())),
                StatusCode::BAD_REQUEST
            );
            assert_eq!(
                status_for(&Error::Conflict("duplicate name".into())),
                StatusCode::CONFLICT
            );
            assert_eq!(
                status_for(&Error::Internal(anyhow::anyhow!("boom"))),
                StatusCode::INTERNAL_SERVER_ERROR
            );
        }
    }
}
