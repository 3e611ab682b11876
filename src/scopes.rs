//! In-process write scopes for reclassification. A propagation holds its
//! fingerprint and installment key exclusively and the groups it touches in
//! shared mode; a migration holds its groups exclusively. Overlaps fail fast
//! with `PropagationConflict` instead of waiting.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use crate::error::{ExtratoError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    Fingerprint { user_id: String, fingerprint: String },
    InstallmentKey { user_id: String, key: String },
    /// Group names compare case-insensitively.
    Group { user_id: String, name: String },
}

impl Scope {
    pub fn fingerprint(user_id: &str, fingerprint: &str) -> Self {
        Scope::Fingerprint {
            user_id: user_id.to_string(),
            fingerprint: fingerprint.to_string(),
        }
    }

    pub fn installment_key(user_id: &str, key: &str) -> Self {
        Scope::InstallmentKey {
            user_id: user_id.to_string(),
            key: key.to_string(),
        }
    }

    pub fn group(user_id: &str, name: &str) -> Self {
        Scope::Group {
            user_id: user_id.to_string(),
            name: name.to_uppercase(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Shared,
    Exclusive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hold {
    Shared(usize),
    Exclusive,
}

#[derive(Debug, Default)]
pub struct WriteScopes {
    held: Mutex<HashMap<Scope, Hold>>,
}

/// Releases its scopes when dropped.
#[derive(Debug)]
pub struct ScopeGuard<'a> {
    scopes: &'a WriteScopes,
    acquired: Vec<Scope>,
}

impl WriteScopes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires every requested scope or none of them.
    pub fn acquire(&self, requests: &[(Scope, Mode)]) -> Result<ScopeGuard<'_>> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());

        // Collapse duplicate requests, exclusive winning.
        let mut wanted: HashMap<&Scope, Mode> = HashMap::new();
        for (scope, mode) in requests {
            let entry = wanted.entry(scope).or_insert(*mode);
            if *mode == Mode::Exclusive {
                *entry = Mode::Exclusive;
            }
        }

        let conflict = wanted.iter().any(|(scope, mode)| match (held.get(*scope), mode) {
            (None, _) => false,
            (Some(Hold::Shared(_)), Mode::Shared) => false,
            _ => true,
        });
        if conflict {
            debug!(?requests, "write scope conflict");
            return Err(ExtratoError::PropagationConflict);
        }

        let mut acquired = Vec::with_capacity(wanted.len());
        for (scope, mode) in wanted {
            let hold = match (held.get(scope), mode) {
                (Some(Hold::Shared(n)), Mode::Shared) => Hold::Shared(n + 1),
                (_, Mode::Shared) => Hold::Shared(1),
                (_, Mode::Exclusive) => Hold::Exclusive,
            };
            held.insert(scope.clone(), hold);
            acquired.push(scope.clone());
        }
        Ok(ScopeGuard { scopes: self, acquired })
    }

    fn release(&self, scopes: &[Scope]) {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        for scope in scopes {
            match held.get(scope).copied() {
                Some(Hold::Shared(n)) if n > 1 => {
                    held.insert(scope.clone(), Hold::Shared(n - 1));
                }
                _ => {
                    held.remove(scope);
                }
            }
        }
    }

    pub fn is_held(&self, scope: &Scope) -> bool {
        self.held.lock().unwrap_or_else(|e| e.into_inner()).contains_key(scope)
    }
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        self.scopes.release(&self.acquired);
    }
}
