use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;
use tracing::debug;

/// Login passwords for the wire protocol.
///
/// Clinic staff listed in `DONORSLOT_STAFF` log in with their own password.
/// Any other user name falls back to the shared server password. Cheap to
/// clone; every connection gets its own handle.
#[derive(Debug, Clone)]
pub struct DonorslotAuthSource {
    logins: Arc<Logins>,
}

#[derive(Debug)]
struct Logins {
    shared: String,
    staff: HashMap<String, String>,
}

impl DonorslotAuthSource {
    pub fn new(shared: String, staff: HashMap<String, String>) -> Self {
        Self {
            logins: Arc::new(Logins { shared, staff }),
        }
    }

    /// Only the shared password; no staff accounts.
    pub fn shared(password: String) -> Self {
        Self::new(password, HashMap::new())
    }

    pub fn password_for(&self, user: Option<&str>) -> &str {
        match user.and_then(|u| self.logins.staff.get(u)) {
            Some(own) => own.as_str(),
            None => self.logins.shared.as_str(),
        }
    }
}

#[async_trait]
impl AuthSource for DonorslotAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let user = login.user();
        if user.is_some_and(|u| self.logins.staff.contains_key(u)) {
            debug!("staff login for {user:?} from {}", login.host());
        }
        Ok(Password::new(None, self.password_for(user).as_bytes().to_vec()))
    }
}
