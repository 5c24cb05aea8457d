//! deckhand cluster client: idempotent reconciliation of a staged
//! deployment against the live cluster.
//!
//! Per object the state machine is get -> compare -> patch-or-create. The
//! get-before-patch step matters: the server computes authoritative
//! defaults that a byte-for-byte overwrite would destroy, so updates go
//! through a merge patch computed against the export-clean live object.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use kube::{
    api::{Api, Patch, PatchParams, PostParams},
    core::{DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use metrics::counter;
use serde_json::Value;
use tracing::{debug, info};

use deckhand_core::{Deployment, Error, Key};

/// Wraps an already-authenticated client plus a one-shot discovery run.
pub struct ClusterClient {
    client: Client,
    discovery: Discovery,
}

impl ClusterClient {
    /// Wrap an existing client. Discovery runs once here and is reused for
    /// every object touched afterwards.
    pub async fn new(client: Client) -> Result<Self> {
        let discovery = Discovery::new(client.clone())
            .run()
            .await
            .context("discovering served api resources")?;
        Ok(Self { client, discovery })
    }

    /// Connect through the ambient kubeconfig / in-cluster environment.
    pub async fn connect() -> Result<Self> {
        let client = Client::try_default().await.context("building kube client")?;
        Self::new(client).await
    }

    /// Reconcile every object in `deployment` against the cluster.
    ///
    /// Namespaces are created first ("already exists" is fine). With
    /// `update` false each object is created and an existing object is a
    /// hard error; with `update` true the live object is fetched, compared,
    /// and patched only when it differs. The first unhandled error aborts
    /// the remaining objects; re-running is safe because the whole
    /// operation is idempotent.
    pub async fn deploy(&self, deployment: &Deployment, update: bool) -> Result<()> {
        counter!("deploy_attempts_total", 1u64);
        self.create_namespaces(deployment).await?;
        for (key, desired) in deployment.iter() {
            self.reconcile(key, desired, update).await?;
        }
        Ok(())
    }

    /// Fetch export-clean live counterparts of `keys` into a deployment.
    /// Objects missing from the cluster are simply absent from the result.
    pub async fn live<'a>(&self, keys: impl IntoIterator<Item = &'a Key>) -> Result<Deployment> {
        let mut out = Deployment::new();
        for key in keys {
            let api = self.dynamic_api(key)?;
            match api.get_opt(&key.name).await {
                Ok(Some(object)) => {
                    let value = strip_server_fields(serde_json::to_value(&object).map_err(Error::Codec)?);
                    out.add(value)?;
                }
                Ok(None) => debug!(key = %key, "object not in cluster"),
                Err(e) => return Err(Error::remote(key, e).into()),
            }
        }
        Ok(out)
    }

    async fn create_namespaces(&self, deployment: &Deployment) -> Result<()> {
        use k8s_openapi::api::core::v1::Namespace;
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

        let api: Api<Namespace> = Api::all(self.client.clone());
        for ns in deployment.namespaces() {
            let object = Namespace {
                metadata: ObjectMeta { name: Some(ns.to_string()), ..Default::default() },
                ..Default::default()
            };
            match api.create(&PostParams::default(), &object).await {
                Ok(_) => info!(namespace = %ns, "namespace created"),
                Err(kube::Error::Api(ae)) if ae.code == 409 => {
                    debug!(namespace = %ns, "namespace already exists");
                }
                Err(e) => {
                    counter!("deploy_err_total", 1u64);
                    let key = Key::new("v1/Namespace", "", ns);
                    return Err(Error::remote(&key, e).into());
                }
            }
        }
        Ok(())
    }

    async fn reconcile(&self, key: &Key, desired: &Value, update: bool) -> Result<()> {
        let api = self.dynamic_api(key)?;
        let desired_object: DynamicObject =
            serde_json::from_value(desired.clone()).map_err(Error::Codec)?;

        if !update {
            return self.create(&api, key, &desired_object).await;
        }

        let live = api
            .get_opt(&key.name)
            .await
            .map_err(|e| Error::remote(key, e))?;
        let Some(live) = live else {
            return self.create(&api, key, &desired_object).await;
        };

        let live_clean = strip_server_fields(serde_json::to_value(&live).map_err(Error::Codec)?);
        let desired_clean = strip_server_fields(desired.clone());
        if live_clean == desired_clean {
            counter!("deploy_noop_total", 1u64);
            debug!(key = %key, "live object already matches");
            return Ok(());
        }

        let patch = merge_patch(&live_clean, &desired_clean);
        match api.patch(&key.name, &PatchParams::default(), &Patch::Merge(&patch)).await {
            Ok(_) => {
                counter!("deploy_patch_total", 1u64);
                info!(key = %key, "object patched");
                Ok(())
            }
            Err(e) => {
                counter!("deploy_err_total", 1u64);
                Err(Error::remote(key, format!("merge patch failed: {}", e)).into())
            }
        }
    }

    async fn create(&self, api: &Api<DynamicObject>, key: &Key, desired: &DynamicObject) -> Result<()> {
        match api.create(&PostParams::default(), desired).await {
            Ok(_) => {
                counter!("deploy_create_total", 1u64);
                info!(key = %key, "object created");
                Ok(())
            }
            Err(e) => {
                counter!("deploy_err_total", 1u64);
                Err(Error::remote(key, e).into())
            }
        }
    }

    fn dynamic_api(&self, key: &Key) -> Result<Api<DynamicObject>> {
        let gvk = parse_gvk_key(&key.gvk)?;
        let (ar, namespaced) = self.find_api_resource(&gvk)?;
        if namespaced {
            if key.namespace.is_empty() {
                return Err(anyhow!("namespace required for namespaced kind {}", key.gvk));
            }
            Ok(Api::namespaced_with(self.client.clone(), &key.namespace, &ar))
        } else {
            Ok(Api::all_with(self.client.clone(), &ar))
        }
    }

    fn find_api_resource(&self, gvk: &GroupVersionKind) -> Result<(kube::core::ApiResource, bool)> {
        for group in self.discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                    let namespaced = matches!(caps.scope, Scope::Namespaced);
                    return Ok((ar.clone(), namespaced));
                }
            }
        }
        Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
    }
}

/// Parse the workspace GVK key form, `v1/Kind` or `group/v1/Kind`.
pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Ok(GroupVersionKind {
            group: String::new(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        [group, version, kind] => Ok(GroupVersionKind {
            group: (*group).to_string(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

/// Drop server-managed fields before comparing or diffing objects.
pub fn strip_server_fields(mut v: Value) -> Value {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
            obj.remove("resourceVersion");
            obj.remove("uid");
            obj.remove("generation");
            obj.remove("creationTimestamp");
            obj.remove("selfLink");
        }
    }
    // status is server-populated; never part of desired state
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

/// RFC 7386-style merge patch turning `live` into `desired`. Keys present
/// only on the live side are nulled out; both inputs are expected to be
/// export-clean (see [`strip_server_fields`]).
pub fn merge_patch(live: &Value, desired: &Value) -> Value {
    match (live, desired) {
        (Value::Object(lo), Value::Object(dobj)) => {
            let mut patch = serde_json::Map::new();
            for (k, dv) in dobj {
                match lo.get(k) {
                    Some(lv) if lv == dv => {}
                    Some(lv) if lv.is_object() && dv.is_object() => {
                        patch.insert(k.clone(), merge_patch(lv, dv));
                    }
                    _ => {
                        patch.insert(k.clone(), dv.clone());
                    }
                }
            }
            for k in lo.keys() {
                if !dobj.contains_key(k) {
                    patch.insert(k.clone(), Value::Null);
                }
            }
            Value::Object(patch)
        }
        _ => desired.clone(),
    }
}
