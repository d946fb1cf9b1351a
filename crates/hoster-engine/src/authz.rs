//! Authorization predicates.
//!
//! Pure functions over the caller context and a resource. Deny decisions for
//! *viewing* surface as not-found so existence never leaks; deny decisions
//! for *managing* a visible resource surface as forbidden.

use hoster_core::auth::AuthContext;
use hoster_store::model::{CloudCredential, CloudProvision, Deployment, Node, SshKey, Template};

pub fn can_view_template(auth: &AuthContext, template: &Template) -> bool {
    template.published || can_manage_template(auth, template)
}

pub fn can_manage_template(auth: &AuthContext, template: &Template) -> bool {
    auth.authenticated && auth.user_id == template.creator_id
}

pub fn can_view_deployment(auth: &AuthContext, deployment: &Deployment) -> bool {
    can_manage_deployment(auth, deployment)
}

pub fn can_manage_deployment(auth: &AuthContext, deployment: &Deployment) -> bool {
    auth.authenticated && auth.user_id == deployment.customer_id
}

pub fn can_manage_node(auth: &AuthContext, node: &Node) -> bool {
    auth.authenticated && auth.user_id == node.creator_id
}

pub fn can_manage_ssh_key(auth: &AuthContext, key: &SshKey) -> bool {
    auth.authenticated && auth.user_id == key.creator_id
}

pub fn can_manage_credential(auth: &AuthContext, credential: &CloudCredential) -> bool {
    auth.authenticated && auth.user_id == credential.creator_id
}

pub fn can_manage_provision(auth: &AuthContext, provision: &CloudProvision) -> bool {
    auth.authenticated && auth.user_id == provision.creator_id
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hoster_core::auth::PlanLimits;
    use hoster_core::resources::ResourceSpec;

    fn auth(user_id: i64) -> AuthContext {
        AuthContext {
            authenticated: true,
            user_id,
            reference_id: format!("auth|{user_id}"),
            plan_id: "free".to_string(),
            plan_limits: PlanLimits::default(),
        }
    }

    fn template(creator_id: i64, published: bool) -> Template {
        Template {
            id: 1,
            reference_id: "tmpl_abcd1234".to_string(),
            creator_id,
            slug: "web".to_string(),
            name: "Web".to_string(),
            version: "1.0.0".to_string(),
            compose_spec: String::new(),
            variables: vec![],
            config_files: vec![],
            required_capabilities: Default::default(),
            resources: ResourceSpec::default(),
            published,
            category: None,
            tags: vec![],
            price_cents: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn unpublished_template_visible_only_to_creator() {
        let tmpl = template(1, false);
        assert!(can_view_template(&auth(1), &tmpl));
        assert!(!can_view_template(&auth(2), &tmpl));
        assert!(!can_view_template(&AuthContext::anonymous(), &tmpl));
    }

    #[test]
    fn published_template_visible_to_everyone_manageable_by_creator() {
        let tmpl = template(1, true);
        assert!(can_view_template(&auth(2), &tmpl));
        assert!(can_view_template(&AuthContext::anonymous(), &tmpl));
        assert!(can_manage_template(&auth(1), &tmpl));
        assert!(!can_manage_template(&auth(2), &tmpl));
    }

    #[test]
    fn unauthenticated_never_manages() {
        let mut anon = auth(1);
        anon.authenticated = false;
        assert!(!can_manage_template(&anon, &template(1, true)));
    }
}
