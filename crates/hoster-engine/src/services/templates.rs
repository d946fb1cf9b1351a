//! Template CRUD and publication.

use std::collections::BTreeSet;

use chrono::Utc;

use hoster_core::auth::AuthContext;
use hoster_core::id::{self, ResourceKind};
use hoster_core::resources::ResourceSpec;
use hoster_core::{Error, Result};
use hoster_store::model::{ConfigFileSpec, Template, TemplateVariable};
use hoster_store::{Store, StoreTx};

use crate::authz;
use crate::engine::Engine;

#[derive(Debug, Clone)]
pub struct NewTemplate {
    pub slug: String,
    pub name: String,
    pub version: String,
    pub compose_spec: String,
    pub variables: Vec<TemplateVariable>,
    pub config_files: Vec<ConfigFileSpec>,
    pub required_capabilities: BTreeSet<String>,
    pub resources: ResourceSpec,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub price_cents: u64,
}

/// Partial update. Content fields are rejected once the template is
/// published; the catalog fields always apply.
#[derive(Debug, Clone, Default)]
pub struct TemplateUpdate {
    pub name: Option<String>,
    pub version: Option<String>,
    pub compose_spec: Option<String>,
    pub variables: Option<Vec<TemplateVariable>>,
    pub config_files: Option<Vec<ConfigFileSpec>>,
    pub required_capabilities: Option<BTreeSet<String>>,
    pub resources: Option<ResourceSpec>,
    pub category: Option<String>,
    pub tags: Option<Vec<String>>,
    pub price_cents: Option<u64>,
}

impl TemplateUpdate {
    fn touches_content(&self) -> bool {
        self.name.is_some()
            || self.version.is_some()
            || self.compose_spec.is_some()
            || self.variables.is_some()
            || self.config_files.is_some()
            || self.required_capabilities.is_some()
            || self.resources.is_some()
    }
}

fn slug_is_valid(slug: &str) -> bool {
    let mut bytes = slug.bytes();
    let Some(first) = bytes.next() else {
        return false;
    };
    first.is_ascii_lowercase()
        && slug.len() <= 63
        && bytes.all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

impl<S: Store> Engine<S> {
    pub async fn create_template(&self, auth: &AuthContext, new: NewTemplate) -> Result<Template> {
        if !auth.authenticated {
            return Err(Error::forbidden("create templates"));
        }
        if !slug_is_valid(&new.slug) {
            return Err(Error::validation("slug", "must match ^[a-z][a-z0-9-]{0,62}$"));
        }
        semver::Version::parse(&new.version)
            .map_err(|e| Error::validation("version", e.to_string()))?;
        if new.compose_spec.trim().is_empty() {
            return Err(Error::validation("compose_spec", "must not be empty"));
        }
        // Surface unparseable compose at create time, not at first start.
        crate::compose::parse_services(&new.compose_spec)?;

        let mut template = Template {
            id: 0,
            reference_id: id::new_ref(ResourceKind::Template),
            creator_id: auth.user_id,
            slug: new.slug,
            name: new.name,
            version: new.version,
            compose_spec: new.compose_spec,
            variables: new.variables,
            config_files: new.config_files,
            required_capabilities: new.required_capabilities,
            resources: new.resources,
            published: false,
            category: new.category,
            tags: new.tags,
            price_cents: new.price_cents,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.store
            .with_tx(move |tx| {
                tx.insert_template(&mut template)?;
                Ok(template)
            })
            .await
    }

    pub async fn update_template(
        &self,
        auth: &AuthContext,
        reference_id: &str,
        update: TemplateUpdate,
    ) -> Result<Template> {
        let auth = auth.clone();
        let reference_id = reference_id.to_string();
        self.store
            .with_tx(move |tx| {
                let mut template = visible_template(tx, &auth, &reference_id)?;
                if !authz::can_manage_template(&auth, &template) {
                    return Err(Error::forbidden("modify this template"));
                }
                if template.published && update.touches_content() {
                    return Err(Error::validation(
                        "template",
                        "published template content is immutable; only category, tags, and price may change",
                    ));
                }
                if let Some(version) = &update.version {
                    semver::Version::parse(version)
                        .map_err(|e| Error::validation("version", e.to_string()))?;
                }
                if let Some(compose) = &update.compose_spec {
                    crate::compose::parse_services(compose)?;
                }

                if let Some(v) = update.name {
                    template.name = v;
                }
                if let Some(v) = update.version {
                    template.version = v;
                }
                if let Some(v) = update.compose_spec {
                    template.compose_spec = v;
                }
                if let Some(v) = update.variables {
                    template.variables = v;
                }
                if let Some(v) = update.config_files {
                    template.config_files = v;
                }
                if let Some(v) = update.required_capabilities {
                    template.required_capabilities = v;
                }
                if let Some(v) = update.resources {
                    template.resources = v;
                }
                if let Some(v) = update.category {
                    template.category = Some(v);
                }
                if let Some(v) = update.tags {
                    template.tags = v;
                }
                if let Some(v) = update.price_cents {
                    template.price_cents = v;
                }
                tx.update_template(&template)?;
                Ok(template)
            })
            .await
    }

    /// Flip to published. Content is immutable from here on; publishing an
    /// already-published template is a no-op.
    pub async fn publish_template(
        &self,
        auth: &AuthContext,
        reference_id: &str,
    ) -> Result<Template> {
        let auth = auth.clone();
        let reference_id = reference_id.to_string();
        self.store
            .with_tx(move |tx| {
                let mut template = visible_template(tx, &auth, &reference_id)?;
                if !authz::can_manage_template(&auth, &template) {
                    return Err(Error::forbidden("publish this template"));
                }
                if !template.published {
                    template.published = true;
                    tx.update_template(&template)?;
                }
                Ok(template)
            })
            .await
    }

    /// Delete. Blocked with `Conflict` while any non-deleted deployment
    /// still references the template.
    pub async fn delete_template(&self, auth: &AuthContext, reference_id: &str) -> Result<()> {
        let auth = auth.clone();
        let reference_id = reference_id.to_string();
        self.store
            .with_tx(move |tx| {
                let template = visible_template(tx, &auth, &reference_id)?;
                if !authz::can_manage_template(&auth, &template) {
                    return Err(Error::forbidden("delete this template"));
                }
                let live = tx.deployments_by_template(template.id)?;
                if !live.is_empty() {
                    return Err(Error::conflict(format!(
                        "template is referenced by {} non-deleted deployment(s)",
                        live.len()
                    )));
                }
                tx.delete_template(template.id)?;
                Ok(())
            })
            .await
    }

    pub async fn get_template(&self, auth: &AuthContext, reference_id: &str) -> Result<Template> {
        let auth = auth.clone();
        let reference_id = reference_id.to_string();
        self.store
            .with_tx(move |tx| visible_template(tx, &auth, &reference_id))
            .await
    }

    /// Published templates plus the caller's own.
    pub async fn list_templates(&self, auth: &AuthContext) -> Result<Vec<Template>> {
        let auth = auth.clone();
        self.store
            .with_tx(move |tx| {
                Ok(tx
                    .list_templates()?
                    .into_iter()
                    .filter(|t| authz::can_view_template(&auth, t))
                    .collect())
            })
            .await
    }
}

/// Fetch by reference, masking invisible templates as not-found so their
/// existence never leaks.
fn visible_template<T: StoreTx>(
    tx: &mut T,
    auth: &AuthContext,
    reference_id: &str,
) -> Result<Template> {
    let template = tx.template_by_ref(reference_id)?;
    if !authz::can_view_template(auth, &template) {
        return Err(Error::not_found("template", reference_id));
    }
    Ok(template)
}
