//! Process-wide defaults.

use std::sync::Mutex;

use ns0_spawn::lookup_user;

use crate::{Error, Result};

static RUN_AS: Mutex<Option<String>> = Mutex::new(None);

/// Fallback uid when no `nobody` account exists.
const NOBODY_UID: u32 = 65534;

fn default_run_as() -> String {
    if lookup_user("nobody").is_ok() {
        String::from("nobody")
    } else {
        NOBODY_UID.to_string()
    }
}

/// The user children run as when a spawn names no explicit user.
pub fn run_as() -> String {
    let mut guard = match RUN_AS.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    };
    guard.get_or_insert_with(default_run_as).clone()
}

/// Change the default user for spawned children.
///
/// Accepts a name or a decimal uid; the account must exist and must not
/// be root.
pub fn set_run_as(user: &str) -> Result<()> {
    let account = lookup_user(user)?;
    if account.uid.is_root() {
        return Err(Error::Config(String::from(
            "cannot run applications as root by default",
        )));
    }
    let mut guard = match RUN_AS.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    };
    *guard = Some(user.to_owned());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_unprivileged() {
        let user = default_run_as();
        assert!(user == "nobody" || user == "65534");
    }

    #[test]
    fn root_is_rejected() {
        assert!(set_run_as("root").is_err());
        assert!(set_run_as("0").is_err());
    }

    #[test]
    fn unknown_user_is_rejected() {
        assert!(set_run_as("ns0-no-such-user").is_err());
    }
}
