use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Caller identity handed to the engine by the API layer. The engine never
/// authenticates anything itself; it only scopes queries by `project` and
/// honors `show_deleted` where a caller is allowed to ask for it.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct RequestContext {
    pub request_id: Uuid,
    pub project: String,
    pub user: Option<String>,
    pub roles: Vec<String>,
    pub show_deleted: bool,
}

impl RequestContext {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            project: project.into(),
            user: None,
            roles: Vec::new(),
            show_deleted: false,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_roles(mut self, roles: Vec<String>) -> Self {
        self.roles = roles;
        self
    }

    pub fn show_deleted(mut self, show: bool) -> Self {
        self.show_deleted = show;
        self
    }

    pub fn is_admin(&self) -> bool {
        self.roles.iter().any(|r| r == "admin")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_role_is_detected() {
        let ctx = RequestContext::new("proj-a").with_roles(vec!["member".into(), "admin".into()]);
        assert!(ctx.is_admin());
        assert!(!RequestContext::new("proj-a").is_admin());
    }

    #[test]
    fn defaults_hide_deleted() {
        assert!(!RequestContext::new("proj-a").show_deleted);
        assert!(RequestContext::new("proj-a").show_deleted(true).show_deleted);
    }
}
