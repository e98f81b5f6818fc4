//! Environment access behind a trait so configuration can be tested without
//! touching the real process environment.

use std::env;

/// Read-only view of environment variables.
pub trait ReadEnv {
    fn var(&self, key: &str) -> Result<String, env::VarError>;
}

/// Zero-sized type; delegates to `std::env`.
pub struct SystemEnv;

impl ReadEnv for SystemEnv {
    #[inline]
    fn var(&self, key: &str) -> Result<String, env::VarError> {
        env::var(key)
    }
}

#[cfg(test)]
pub use in_memory::InMemoryEnv;


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_env_matches_std() {
        assert_eq!(SystemEnv.var("PATH").is_ok(), std::env::var("PATH").is_ok());
        assert!(SystemEnv.var("TROGON_SHIM_SURELY_UNSET_42").is_err());
    }

    #[test]
    fn in_memory_env_returns_only_what_was_set() {
        let env = InMemoryEnv::new();
        assert!(matches!(env.var("UPSTREAM_PORT"), Err(std::env::VarError::NotPresent)));

        env.set("UPSTREAM_PORT", "4000");
        assert_eq!(env.var("UPSTREAM_PORT").unwrap(), "4000");
    }
}
