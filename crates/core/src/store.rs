//! Contract for the version store collaborator. The git-backed document
//! store itself lives outside this workspace; status only needs its staged
//! index and committed head.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Deployment, Error};

/// A staged document: its repository path and the materialized object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub path: String,
    pub object: serde_json::Value,
}

pub trait Repository {
    /// Staged documents by repository path.
    fn index(&self) -> Result<BTreeMap<String, Document>, Error>;

    /// The committed snapshot, already flattened into a deployment.
    fn head(&self) -> Result<Deployment, Error>;
}
