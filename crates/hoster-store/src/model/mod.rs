//! Persisted entities and their status machines.

mod credential;
mod deployment;
mod event;
mod key;
mod node;
mod provision;
mod template;
mod user;

pub use credential::CloudCredential;
pub use deployment::{
    Deployment, DeploymentContainer, DeploymentDomain, DeploymentStatus, DomainKind,
    VerificationStatus,
};
pub use event::{ContainerEvent, UsageEvent};
pub use key::SshKey;
pub use node::{Node, NodeStatus};
pub use provision::{CloudProvision, ProvisionStatus};
pub use template::{ConfigFileSpec, Template, TemplateVariable, VariableType};
pub use user::User;
