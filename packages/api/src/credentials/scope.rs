use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Operator,
    Dispatcher,
    Worker,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Operator => "operator",
            Role::Dispatcher => "dispatcher",
            Role::Worker => "worker",
        }
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single permitted operation carried in an access token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Scope {
    #[serde(rename = "task:submit")]
    TaskSubmit,
    #[serde(rename = "task:read")]
    TaskRead,
    #[serde(rename = "task:cancel")]
    TaskCancel,
    #[serde(rename = "dead_letter:read")]
    DeadLetterRead,
    #[serde(rename = "queue:claim")]
    QueueClaim,
    #[serde(rename = "queue:ack")]
    QueueAck,
    #[serde(rename = "queue:extend")]
    QueueExtend,
    #[serde(rename = "queue:nack")]
    QueueNack,
    #[serde(rename = "object:presign")]
    ObjectPresign,
    #[serde(rename = "status:report")]
    StatusReport,
}

impl Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::TaskSubmit => write!(f, "task:submit"),
            Scope::TaskRead => write!(f, "task:read"),
            Scope::TaskCancel => write!(f, "task:cancel"),
            Scope::DeadLetterRead => write!(f, "dead_letter:read"),
            Scope::QueueClaim => write!(f, "queue:claim"),
            Scope::QueueAck => write!(f, "queue:ack"),
            Scope::QueueExtend => write!(f, "queue:extend"),
            Scope::QueueNack => write!(f, "queue:nack"),
            Scope::ObjectPresign => write!(f, "object:presign"),
            Scope::StatusReport => write!(f, "status:report"),
        }
    }
}

pub const USER_SCOPES: &[Scope] = &[Scope::TaskSubmit, Scope::TaskRead, Scope::TaskCancel];

pub const DISPATCHER_SCOPES: &[Scope] = &[
    Scope::QueueClaim,
    Scope::QueueAck,
    Scope::QueueExtend,
    Scope::QueueNack,
    Scope::ObjectPresign,
];

pub const WORKER_SCOPES: &[Scope] = &[Scope::StatusReport];

/// Static table of the widest scope each role may ever be issued.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScopePolicy {
    roles: HashMap<Role, BTreeSet<Scope>>,
}

impl Default for ScopePolicy {
    fn default() -> Self {
        let mut roles = HashMap::new();
        roles.insert(Role::User, USER_SCOPES.iter().copied().collect());
        roles.insert(
            Role::Operator,
            USER_SCOPES
                .iter()
                .copied()
                .chain([Scope::DeadLetterRead])
                .collect(),
        );
        roles.insert(Role::Dispatcher, DISPATCHER_SCOPES.iter().copied().collect());
        roles.insert(Role::Worker, WORKER_SCOPES.iter().copied().collect());
        Self { roles }
    }
}

impl ScopePolicy {
    pub fn new(roles: HashMap<Role, BTreeSet<Scope>>) -> Self {
        Self { roles }
    }

    pub fn allowed(&self, role: Role) -> BTreeSet<Scope> {
        self.roles.get(&role).cloned().unwrap_or_default()
    }

    /// Scopes in `requested` the role may not hold. Empty when the request
    /// is within policy.
    pub fn excess(&self, role: Role, requested: &BTreeSet<Scope>) -> Vec<Scope> {
        let allowed = self.roles.get(&role);
        requested
            .iter()
            .filter(|scope| !allowed.is_some_and(|set| set.contains(scope)))
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_names_round_trip() {
        let json = serde_json::to_string(&Scope::DeadLetterRead).unwrap();
        assert_eq!(json, "\"dead_letter:read\"");
        assert_eq!(Scope::QueueClaim.to_string(), "queue:claim");
        let parsed: Scope = serde_json::from_str("\"status:report\"").unwrap();
        assert_eq!(parsed, Scope::StatusReport);
    }

    #[test]
    fn user_cannot_claim() {
        let policy = ScopePolicy::default();
        let requested = [Scope::TaskSubmit, Scope::QueueClaim].into_iter().collect();
        assert_eq!(policy.excess(Role::User, &requested), vec![Scope::QueueClaim]);
    }

    #[test]
    fn operator_extends_user() {
        let policy = ScopePolicy::default();
        let operator = policy.allowed(Role::Operator);
        assert!(policy.allowed(Role::User).is_subset(&operator));
        assert!(operator.contains(&Scope::DeadLetterRead));
    }

    #[test]
    fn worker_only_reports() {
        let policy = ScopePolicy::default();
        assert_eq!(
            policy.allowed(Role::Worker).into_iter().collect::<Vec<_>>(),
            vec![Scope::StatusReport]
        );
    }
}
