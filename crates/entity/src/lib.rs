//! deckhand entity tree: typed composition of application, controller, pod,
//! container and image nodes, flattened into a deployable collection.
//!
//! Nested payloads live in exactly one place: a controller's pod template
//! becomes a Pod child and is stripped from the stored spec, a pod's
//! containers become Container children, a container's image becomes an
//! Image child. Flattening substitutes them back in.

#![forbid(unsafe_code)]

use std::fmt;

use k8s_openapi::api::apps::v1 as apps;
use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::Resource;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use deckhand_core::{Deployment, Error, Key, MetaDefaults};

/// Position of a node in the composition order. Children must come strictly
/// later in this order than their parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityType {
    Application,
    Controller,
    Pod,
    Container,
    Image,
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntityType::Application => "application",
            EntityType::Controller => "controller",
            EntityType::Pod => "pod",
            EntityType::Container => "container",
            EntityType::Image => "image",
        };
        f.write_str(s)
    }
}

/// A container image reference, `name[:tag]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub name: String,
    pub tag: Option<String>,
}

impl ImageRef {
    /// Parse a reference. The tag separator is the ':' after the last '/',
    /// so registry ports (`localhost:5000/app`) don't split.
    pub fn parse(raw: &str) -> Result<ImageRef, Error> {
        if raw.is_empty() {
            return Err(Error::Validation("empty image reference".into()));
        }
        let base = raw.rfind('/').map(|i| i + 1).unwrap_or(0);
        match raw[base..].rfind(':') {
            Some(rel) => {
                let i = base + rel;
                let (name, tag) = (&raw[..i], &raw[i + 1..]);
                if name.is_empty() || tag.is_empty() {
                    return Err(Error::Validation(format!("malformed image reference {:?}", raw)));
                }
                Ok(ImageRef { name: name.to_string(), tag: Some(tag.to_string()) })
            }
            None => Ok(ImageRef { name: raw.to_string(), tag: None }),
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.tag {
            Some(tag) => write!(f, "{}:{}", self.name, tag),
            None => f.write_str(&self.name),
        }
    }
}

/// Type-specific payload. Closed set; dispatch is by pattern match.
#[derive(Debug, Clone)]
enum Payload {
    Application,
    /// apps/v1 Deployment with `spec.template` stripped into a Pod child.
    Controller(Box<apps::Deployment>),
    /// v1 Pod with `spec.containers` stripped into Container children.
    Pod(Box<corev1::Pod>),
    /// v1 Container with `image` stripped into an Image child.
    Container(Box<corev1::Container>),
    Image(ImageRef),
}

/// A node in the composition tree. Owns its children exclusively; attach is
/// one-time and one-directional.
#[derive(Debug, Clone)]
pub struct Entity {
    payload: Payload,
    source: String,
    defaults: MetaDefaults,
    /// Free-standing objects bundled with this node. Kept as a plain list
    /// and keyed only at flatten time, after the defaults cascade settles
    /// the namespace component of each identity key.
    attached: Vec<Value>,
    children: Vec<Entity>,
}

impl Entity {
    pub fn application(defaults: MetaDefaults, source: &str, extra: Vec<Value>) -> Result<Entity, Error> {
        Entity::base(Payload::Application, defaults, source, extra)
    }

    /// Build a controller node from an apps/v1 Deployment. The pod template
    /// is split off into a Pod child and the stored spec keeps an empty
    /// template in its place.
    pub fn controller(
        controller: apps::Deployment,
        defaults: MetaDefaults,
        source: &str,
        extra: Vec<Value>,
    ) -> Result<Entity, Error> {
        let mut controller = controller;
        let spec = controller
            .spec
            .as_mut()
            .ok_or_else(|| Error::Validation(format!("controller from {}: missing spec", source)))?;
        let template = std::mem::take(&mut spec.template);
        let pod = corev1::Pod {
            metadata: template.metadata.unwrap_or_default(),
            spec: template.spec,
            ..Default::default()
        };
        let pod_entity = Entity::pod(pod, MetaDefaults::default(), source, Vec::new())?;
        let mut entity = Entity::base(Payload::Controller(Box::new(controller)), defaults, source, extra)?;
        entity.attach(pod_entity)?;
        Ok(entity)
    }

    /// Build a pod node from a v1 Pod. Containers are split off into
    /// Container children; the stored spec keeps everything else.
    pub fn pod(pod: corev1::Pod, defaults: MetaDefaults, source: &str, extra: Vec<Value>) -> Result<Entity, Error> {
        let mut pod = pod;
        let mut containers = Vec::new();
        if let Some(spec) = pod.spec.as_mut() {
            for container in std::mem::take(&mut spec.containers) {
                containers.push(Entity::container(container, MetaDefaults::default(), source, Vec::new())?);
            }
        }
        let mut entity = Entity::base(Payload::Pod(Box::new(pod)), defaults, source, extra)?;
        for container in containers {
            entity.attach(container)?;
        }
        Ok(entity)
    }

    pub fn container(
        container: corev1::Container,
        defaults: MetaDefaults,
        source: &str,
        extra: Vec<Value>,
    ) -> Result<Entity, Error> {
        let mut container = container;
        if container.name.is_empty() {
            return Err(Error::Validation(format!("container from {}: missing name", source)));
        }
        let image = match container.image.take() {
            Some(raw) => Some(Entity::image(ImageRef::parse(&raw)?, MetaDefaults::default(), source, Vec::new())?),
            None => None,
        };
        let mut entity = Entity::base(Payload::Container(Box::new(container)), defaults, source, extra)?;
        if let Some(image) = image {
            entity.attach(image)?;
        }
        Ok(entity)
    }

    pub fn image(reference: ImageRef, defaults: MetaDefaults, source: &str, extra: Vec<Value>) -> Result<Entity, Error> {
        Entity::base(Payload::Image(reference), defaults, source, extra)
    }

    fn base(payload: Payload, defaults: MetaDefaults, source: &str, extra: Vec<Value>) -> Result<Entity, Error> {
        let mut attached = Vec::with_capacity(extra.len());
        for mut object in extra {
            defaults.apply_to(&mut object);
            // structural validation up front; keying happens again at flatten
            Key::from_object(&object)?;
            attached.push(object);
        }
        Ok(Entity { payload, source: source.to_string(), defaults, attached, children: Vec::new() })
    }

    pub fn entity_type(&self) -> EntityType {
        match &self.payload {
            Payload::Application => EntityType::Application,
            Payload::Controller(_) => EntityType::Controller,
            Payload::Pod(_) => EntityType::Pod,
            Payload::Container(_) => EntityType::Container,
            Payload::Image(_) => EntityType::Image,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn defaults(&self) -> &MetaDefaults {
        &self.defaults
    }

    pub fn children(&self) -> &[Entity] {
        &self.children
    }

    /// Take ownership of `child` as a subtree of this node.
    ///
    /// Fails when the child does not come later in the composition order, or
    /// when the parent's cardinality is exhausted: a container holds at most
    /// one image, and a controller's single pod is fixed at construction.
    pub fn attach(&mut self, child: Entity) -> Result<(), Error> {
        if child.entity_type() <= self.entity_type() {
            return Err(Error::Validation(format!(
                "cannot attach {} to {}: children must come later in the composition order",
                child.entity_type(),
                self.entity_type()
            )));
        }
        match &self.payload {
            Payload::Container(c) if !self.children.is_empty() => {
                return Err(Error::Validation(format!("container {}: max attached", c.name)));
            }
            Payload::Controller(_)
                if child.entity_type() == EntityType::Pod && self.pod_child().is_some() =>
            {
                return Err(Error::Validation(format!(
                    "controller {}: max attached, the pod is set from the template",
                    self.display_name()
                )));
            }
            _ => {}
        }
        let mut child = child;
        child.inherit(&self.defaults);
        self.children.push(child);
        Ok(())
    }

    /// One-way defaults cascade: the parent fills gaps in this subtree's
    /// defaults, existing keys keep winning. Copies on every level.
    fn inherit(&mut self, parent: &MetaDefaults) {
        self.defaults = parent.overlay(&self.defaults);
        let effective = self.defaults.clone();
        for child in &mut self.children {
            child.inherit(&effective);
        }
    }

    /// All image references reachable from this node. Pure collection.
    pub fn images(&self) -> Vec<ImageRef> {
        let mut out = Vec::new();
        self.collect_images(&mut out);
        out
    }

    fn collect_images(&self, out: &mut Vec<ImageRef>) {
        if let Payload::Image(reference) = &self.payload {
            out.push(reference.clone());
        }
        for child in &self.children {
            child.collect_images(out);
        }
    }

    /// Flatten the subtree into a deployable collection. Read-only and
    /// repeatable; a single missing leaf fails the whole flatten.
    pub fn deployment(&self) -> Result<Deployment, Error> {
        let mut out = Deployment::new();
        self.flatten_into(&mut out)?;
        Ok(out)
    }

    fn flatten_into(&self, out: &mut Deployment) -> Result<(), Error> {
        self.add_attached(out)?;
        match &self.payload {
            Payload::Application => {
                for child in &self.children {
                    child.flatten_into(out)?;
                }
            }
            Payload::Controller(controller) => {
                let pod = self
                    .pod_child()
                    .ok_or_else(|| Error::NotReady(format!("controller {}: no pod", self.display_name())))?;
                let (template_meta, pod_spec) = pod.resolve_pod()?;
                let mut controller = (**controller).clone();
                let spec = controller
                    .spec
                    .as_mut()
                    .ok_or_else(|| Error::NotReady(format!("controller {}: missing spec", self.display_name())))?;
                spec.template = corev1::PodTemplateSpec {
                    metadata: Some(template_meta),
                    spec: Some(pod_spec),
                };
                let mut object = serde_json::to_value(&controller)?;
                ensure_type_meta(&mut object, apps::Deployment::API_VERSION, apps::Deployment::KIND);
                self.defaults.apply_to(&mut object);
                out.add(object)?;
                for child in &self.children {
                    if std::ptr::eq(child, pod) {
                        // template pod: its bundled objects still deploy, the
                        // pod object itself is represented by the controller
                        child.add_attached_recursive(out)?;
                    } else {
                        child.flatten_into(out)?;
                    }
                }
            }
            Payload::Pod(_) => {
                let (metadata, spec) = self.resolve_pod()?;
                let pod_object = corev1::Pod { metadata, spec: Some(spec), ..Default::default() };
                let mut object = serde_json::to_value(&pod_object)?;
                ensure_type_meta(&mut object, corev1::Pod::API_VERSION, corev1::Pod::KIND);
                self.defaults.apply_to(&mut object);
                out.add(object)?;
                for child in &self.children {
                    child.add_attached_recursive(out)?;
                }
            }
            Payload::Container(_) => {
                // readiness gate: a container without an image aborts the flatten
                self.resolve_container()?;
                for child in &self.children {
                    child.add_attached_recursive(out)?;
                }
            }
            Payload::Image(_) => {}
        }
        Ok(())
    }

    /// Reconstitute the pod spec: container children substituted back in.
    fn resolve_pod(&self) -> Result<(ObjectMeta, corev1::PodSpec), Error> {
        let pod = match &self.payload {
            Payload::Pod(pod) => pod,
            _ => return Err(Error::Validation(format!("{} is not a pod", self.entity_type()))),
        };
        let mut spec = pod
            .spec
            .clone()
            .ok_or_else(|| Error::NotReady(format!("pod {}: missing spec", self.display_name())))?;
        let mut containers = Vec::new();
        for child in &self.children {
            if let Payload::Container(_) = child.payload {
                containers.push(child.resolve_container()?);
            }
        }
        if containers.is_empty() {
            return Err(Error::NotReady(format!("pod {}: no containers", self.display_name())));
        }
        spec.containers = containers;
        Ok((pod.metadata.clone(), spec))
    }

    /// Reconstitute the container spec: image child substituted back in.
    fn resolve_container(&self) -> Result<corev1::Container, Error> {
        let container = match &self.payload {
            Payload::Container(container) => container,
            _ => return Err(Error::Validation(format!("{} is not a container", self.entity_type()))),
        };
        let image = self
            .children
            .iter()
            .find_map(|child| match &child.payload {
                Payload::Image(reference) => Some(reference.to_string()),
                _ => None,
            })
            .ok_or_else(|| Error::NotReady(format!("container {}: no image", container.name)))?;
        let mut out = (**container).clone();
        out.image = Some(image);
        Ok(out)
    }

    fn add_attached(&self, out: &mut Deployment) -> Result<(), Error> {
        for object in &self.attached {
            let mut object = object.clone();
            self.defaults.apply_to(&mut object);
            out.add(object)?;
        }
        Ok(())
    }

    fn add_attached_recursive(&self, out: &mut Deployment) -> Result<(), Error> {
        self.add_attached(out)?;
        for child in &self.children {
            child.add_attached_recursive(out)?;
        }
        Ok(())
    }

    fn pod_child(&self) -> Option<&Entity> {
        self.children.iter().find(|c| matches!(c.payload, Payload::Pod(_)))
    }

    fn display_name(&self) -> String {
        let name = match &self.payload {
            Payload::Application => None,
            Payload::Controller(c) => c.metadata.name.clone().or_else(|| c.metadata.generate_name.clone()),
            Payload::Pod(p) => p.metadata.name.clone().or_else(|| p.metadata.generate_name.clone()),
            Payload::Container(c) => Some(c.name.clone()),
            Payload::Image(r) => Some(r.to_string()),
        };
        name.unwrap_or_else(|| format!("<{}>", self.source))
    }
}

fn ensure_type_meta(object: &mut Value, api_version: &str, kind: &str) {
    if let Some(map) = object.as_object_mut() {
        map.insert("apiVersion".into(), Value::String(api_version.to_string()));
        map.insert("kind".into(), Value::String(kind.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_ref_parses_plain_and_tagged() {
        let plain = ImageRef::parse("redis").expect("plain");
        assert_eq!(plain.name, "redis");
        assert_eq!(plain.tag, None);

        let tagged = ImageRef::parse("redis:latest").expect("tagged");
        assert_eq!(tagged.name, "redis");
        assert_eq!(tagged.tag.as_deref(), Some("latest"));
        assert_eq!(tagged.to_string(), "redis:latest");
    }

    #[test]
    fn image_ref_keeps_registry_ports_out_of_the_tag() {
        let r = ImageRef::parse("localhost:5000/app").expect("registry port");
        assert_eq!(r.name, "localhost:5000/app");
        assert_eq!(r.tag, None);

        let r = ImageRef::parse("localhost:5000/app:v2").expect("registry port + tag");
        assert_eq!(r.name, "localhost:5000/app");
        assert_eq!(r.tag.as_deref(), Some("v2"));
    }

    #[test]
    fn image_ref_rejects_junk() {
        assert!(ImageRef::parse("").is_err());
        assert!(ImageRef::parse("redis:").is_err());
        assert!(ImageRef::parse(":latest").is_err());
    }

    #[test]
    fn entity_type_order_matches_composition_order() {
        assert!(EntityType::Application < EntityType::Controller);
        assert!(EntityType::Controller < EntityType::Pod);
        assert!(EntityType::Pod < EntityType::Container);
        assert!(EntityType::Container < EntityType::Image);
    }

    #[test]
    fn container_strips_image_into_child() {
        let c = corev1::Container {
            name: "web".into(),
            image: Some("nginx:1.27".into()),
            ..Default::default()
        };
        let entity = Entity::container(c, MetaDefaults::default(), "test", Vec::new()).expect("container");
        assert_eq!(entity.children().len(), 1);
        assert_eq!(entity.children()[0].entity_type(), EntityType::Image);
        let images = entity.images();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].to_string(), "nginx:1.27");
        // the stored spec no longer carries the image
        match &entity.payload {
            Payload::Container(c) => assert!(c.image.is_none()),
            _ => panic!("wrong payload"),
        }
    }

    #[test]
    fn container_requires_a_name() {
        let c = corev1::Container::default();
        assert!(matches!(
            Entity::container(c, MetaDefaults::default(), "test", Vec::new()),
            Err(Error::Validation(_))
        ));
    }
}
