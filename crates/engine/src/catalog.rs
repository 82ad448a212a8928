//! Administrative CRUD over components, microservices and GOMs.

use std::collections::BTreeSet;
use std::sync::Arc;

use megamodel_storage::{
    CoherenceStore, ComponentRecord, GomRecord, MicroserviceRecord, MicroserviceRequirement,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::condition::Condition;
use crate::error::EngineError;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentDraft {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub metamodel: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MicroserviceDraft {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GomDraft {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub microservice_requirements: Vec<MicroserviceRequirement>,
    #[serde(default)]
    pub preconditions: Vec<String>,
    #[serde(default)]
    pub postconditions: Vec<String>,
}

/// Catalog operations. Every mutation is validated before it reaches the store.
pub struct Catalog<S> {
    store: Arc<S>,
}

fn assign_id(requested: Option<String>) -> Result<String, EngineError> {
    match requested.map(|id| id.trim().to_string()) {
        Some(id) if id.is_empty() => Ok(Uuid::new_v4().to_string()),
        Some(id) if id.contains('/') || id.chars().any(char::is_whitespace) => Err(
            EngineError::Validation(format!("id `{id}` must not contain '/' or whitespace")),
        ),
        Some(id) => Ok(id),
        None => Ok(Uuid::new_v4().to_string()),
    }
}

fn require_name(name: &str, what: &str) -> Result<String, EngineError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(EngineError::Validation(format!("{what} name must not be empty")));
    }
    Ok(name.to_string())
}

/// An update body may repeat the id it targets, but not name another one.
fn check_same_id(path_id: &str, body_id: Option<&str>) -> Result<(), EngineError> {
    match body_id {
        Some(body) if !body.is_empty() && body != path_id => Err(EngineError::Validation(
            format!("body id `{body}` does not match `{path_id}`"),
        )),
        _ => Ok(()),
    }
}

impl<S: CoherenceStore> Catalog<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    // ──────────────────────────────────────────────
    // Components
    // ──────────────────────────────────────────────

    pub async fn list_components(&self) -> Result<Vec<ComponentRecord>, EngineError> {
        Ok(self.store.list_components().await?)
    }

    pub async fn get_component(&self, id: &str) -> Result<ComponentRecord, EngineError> {
        Ok(self.store.get_component(id).await?)
    }

    pub async fn create_component(
        &self,
        draft: ComponentDraft,
    ) -> Result<ComponentRecord, EngineError> {
        let record = ComponentRecord {
            id: assign_id(draft.id)?,
            name: require_name(&draft.name, "component")?,
            metamodel: draft.metamodel,
            description: draft.description,
        };
        self.store.insert_component(record.clone()).await?;
        tracing::info!(component = %record.id, name = %record.name, "component created");
        Ok(record)
    }

    /// Edit metadata. The id is fixed.
    pub async fn update_component(
        &self,
        id: &str,
        draft: ComponentDraft,
    ) -> Result<ComponentRecord, EngineError> {
        check_same_id(id, draft.id.as_deref())?;
        let record = ComponentRecord {
            id: id.to_string(),
            name: require_name(&draft.name, "component")?,
            metamodel: draft.metamodel,
            description: draft.description,
        };
        self.store.update_component(record.clone()).await?;
        Ok(record)
    }

    pub async fn delete_component(&self, id: &str) -> Result<(), EngineError> {
        self.store.delete_component(id).await?;
        tracing::info!(component = %id, "component deleted");
        Ok(())
    }

    // ──────────────────────────────────────────────
    // Microservices
    // ──────────────────────────────────────────────

    pub async fn list_microservices(&self) -> Result<Vec<MicroserviceRecord>, EngineError> {
        Ok(self.store.list_microservices().await?)
    }

    pub async fn get_microservice(&self, id: &str) -> Result<MicroserviceRecord, EngineError> {
        Ok(self.store.get_microservice(id).await?)
    }

    pub async fn create_microservice(
        &self,
        draft: MicroserviceDraft,
    ) -> Result<MicroserviceRecord, EngineError> {
        let record = MicroserviceRecord {
            id: assign_id(draft.id)?,
            name: require_name(&draft.name, "microservice")?,
            description: draft.description,
        };
        self.store.insert_microservice(record.clone()).await?;
        tracing::info!(microservice = %record.id, name = %record.name, "microservice created");
        Ok(record)
    }

    pub async fn update_microservice(
        &self,
        id: &str,
        draft: MicroserviceDraft,
    ) -> Result<MicroserviceRecord, EngineError> {
        check_same_id(id, draft.id.as_deref())?;
        let record = MicroserviceRecord {
            id: id.to_string(),
            name: require_name(&draft.name, "microservice")?,
            description: draft.description,
        };
        self.store.update_microservice(record.clone()).await?;
        Ok(record)
    }

    pub async fn delete_microservice(&self, id: &str) -> Result<(), EngineError> {
        self.store.delete_microservice(id).await?;
        tracing::info!(microservice = %id, "microservice deleted");
        Ok(())
    }

    // ──────────────────────────────────────────────
    // Global Operation Models
    // ──────────────────────────────────────────────

    pub async fn list_goms(&self) -> Result<Vec<GomRecord>, EngineError> {
        Ok(self.store.list_goms().await?)
    }

    pub async fn get_gom(&self, id: &str) -> Result<GomRecord, EngineError> {
        Ok(self.store.get_gom(id).await?)
    }

    pub async fn create_gom(&self, draft: GomDraft) -> Result<GomRecord, EngineError> {
        let id = assign_id(draft.id.clone())?;
        let record = self.build_gom(id, draft).await?;
        self.store.insert_gom(record.clone()).await?;
        tracing::info!(gom = %record.id, name = %record.name, "gom created");
        Ok(record)
    }

    /// Replace a GOM. Running and finished instances keep the model they
    /// started with.
    pub async fn update_gom(&self, id: &str, draft: GomDraft) -> Result<GomRecord, EngineError> {
        check_same_id(id, draft.id.as_deref())?;
        let record = self.build_gom(id.to_string(), draft).await?;
        self.store.update_gom(record.clone()).await?;
        Ok(record)
    }

    /// Delete a GOM and all of its instances.
    pub async fn delete_gom(&self, id: &str) -> Result<(), EngineError> {
        self.store.delete_gom(id).await?;
        tracing::info!(gom = %id, "gom deleted");
        Ok(())
    }

    async fn build_gom(&self, id: String, draft: GomDraft) -> Result<GomRecord, EngineError> {
        let record = GomRecord {
            id,
            name: require_name(&draft.name, "gom")?,
            description: draft.description,
            microservice_requirements: draft.microservice_requirements,
            preconditions: draft.preconditions,
            postconditions: draft.postconditions,
        };
        validate_gom_shape(&record)?;
        for req in &record.microservice_requirements {
            self.store.get_microservice(&req.microservice_id).await?;
            for component in &req.required_components {
                self.store.get_component(&component.component_id).await?;
            }
        }
        Ok(record)
    }
}

/// Checks that need no store: unique steps and parseable conditions.
pub fn validate_gom_shape(gom: &GomRecord) -> Result<(), EngineError> {
    let mut seen = BTreeSet::new();
    for (microservice, req) in gom.steps() {
        if !seen.insert((microservice, req.component_id.as_str())) {
            return Err(EngineError::Validation(format!(
                "{microservice}/{} is required more than once",
                req.component_id
            )));
        }
    }
    for text in gom.preconditions.iter().chain(&gom.postconditions) {
        Condition::parse(text)?;
    }
    Ok(())
}
