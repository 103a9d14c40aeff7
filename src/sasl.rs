//! SASL for the test broker.
//!
//! No authentication is performed. ANONYMOUS and PLAIN are offered and any
//! exchange completes with `ok`, whatever credentials a PLAIN client sends.

use fe2o3_amqp::acceptor::sasl_acceptor::SaslServerFrame;
use fe2o3_amqp::acceptor::SaslAcceptor;
use fe2o3_amqp::types::primitives::{Array, Symbol};
use fe2o3_amqp::types::sasl::{SaslCode, SaslInit, SaslOutcome, SaslResponse};
use tracing::debug;

pub const ANONYMOUS: &str = "ANONYMOUS";
pub const PLAIN: &str = "PLAIN";

#[derive(Debug, Clone, Default)]
pub struct PermissiveSaslAcceptor;

impl PermissiveSaslAcceptor {
    fn complete() -> SaslServerFrame {
        SaslServerFrame::Outcome(SaslOutcome {
            code: SaslCode::Ok,
            additional_data: None,
        })
    }
}

/// Authentication identity of a PLAIN `authzid NUL authcid NUL passwd`
/// response, if it is well formed.
fn plain_username(response: &[u8]) -> Option<String> {
    let mut parts = response.split(|b| *b == 0);
    let _authzid = parts.next()?;
    let authcid = parts.next()?;
    parts.next()?;
    String::from_utf8(authcid.to_vec()).ok()
}

impl SaslAcceptor for PermissiveSaslAcceptor {
    fn mechanisms(&self) -> Array<Symbol> {
        Array::from(vec![Symbol::from(ANONYMOUS), Symbol::from(PLAIN)])
    }

    fn on_init(&mut self, init: SaslInit) -> SaslServerFrame {
        if init.mechanism.as_str() == PLAIN {
            let user = init
                .initial_response
                .as_ref()
                .and_then(|r| plain_username(r));
            debug!(user = ?user, "SASL PLAIN accepted without checking");
        } else {
            debug!(mechanism = %init.mechanism.as_str(), "SASL accepted");
        }
        Self::complete()
    }

    fn on_response(&mut self, _response: SaslResponse) -> SaslServerFrame {
        Self::complete()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fe2o3_amqp::types::primitives::Binary;

    fn init(mechanism: &str, response: Option<&[u8]>) -> SaslInit {
        SaslInit {
            mechanism: Symbol::from(mechanism),
            initial_response: response.map(|r| Binary::from(r.to_vec())),
            hostname: None,
        }
    }

    fn is_ok(frame: SaslServerFrame) -> bool {
        matches!(frame, SaslServerFrame::Outcome(outcome) if outcome.code == SaslCode::Ok)
    }

    #[test]
    fn test_offers_anonymous_and_plain_only() {
        let offered = PermissiveSaslAcceptor.mechanisms();
        let names: Vec<&str> = offered.0.iter().map(|s| s.as_str()).collect();
        assert_eq!(names, vec![ANONYMOUS, PLAIN]);
    }

    #[test]
    fn test_plain_accepts_any_credentials() {
        let mut acceptor = PermissiveSaslAcceptor;
        for response in [
            &b"\0guest\0guest"[..],
            &b"admin\0root\0wrong-password"[..],
            &b"\0\0"[..],
        ] {
            assert!(is_ok(acceptor.on_init(init(PLAIN, Some(response)))));
        }
    }

    #[test]
    fn test_plain_without_credentials_is_accepted() {
        let mut acceptor = PermissiveSaslAcceptor;
        assert!(is_ok(acceptor.on_init(init(PLAIN, None))));
        assert!(is_ok(acceptor.on_init(init(PLAIN, Some(&b"not plain"[..])))));
    }

    #[test]
    fn test_anonymous_with_trace_is_accepted() {
        let mut acceptor = PermissiveSaslAcceptor;
        assert!(is_ok(acceptor.on_init(init(ANONYMOUS, Some(&b"tester@example"[..])))));
        assert!(is_ok(acceptor.on_init(init(ANONYMOUS, None))));
    }

    #[test]
    fn test_challenge_response_completes() {
        let mut acceptor = PermissiveSaslAcceptor;
        let response = SaslResponse {
            response: Binary::from(Vec::new()),
        };
        assert!(is_ok(acceptor.on_response(response)));
    }

    #[test]
    fn test_plain_username() {
        assert_eq!(plain_username(b"\0guest\0secret").as_deref(), Some("guest"));
        assert_eq!(plain_username(b"admin\0bob\0pw").as_deref(), Some("bob"));
        assert_eq!(plain_username(b"no separators"), None);
        assert_eq!(plain_username(b"\0only-user"), None);
    }
}
