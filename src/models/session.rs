//! # models::session
//!
//! Session objects returned by the provider's login endpoint.

use serde::{Deserialize, Serialize};

/// Tokens that authenticate the streaming transport and every REST call.
/// Valid until superseded by the next renewal cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCredentials {
    /// Client session token (`CST` response header).
    pub cst: String,
    /// Account security token (`X-SECURITY-TOKEN` response header).
    pub security_token: String,
}

impl SessionCredentials {
    /// Transport password in the provider's expected format.
    pub fn transport_password(&self) -> String {
        format!("CST-{}|XST-{}", self.cst, self.security_token)
    }
}

/// One account attached to the login session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IgAccount {
    pub account_id:   String,
    pub account_type: String,
}

/// Everything a successful login yields.
#[derive(Debug, Clone)]
pub struct LoginSession {
    pub credentials:             SessionCredentials,
    pub lightstreamer_endpoint:  String,
    pub accounts:                Vec<IgAccount>,
}

impl LoginSession {
    /// The spread-bet account drives the streaming connection identity.
    pub fn spreadbet_account(&self) -> Option<&IgAccount> {
        self.accounts.iter().find(|acc| acc.account_type == "SPREADBET")
    }
}
