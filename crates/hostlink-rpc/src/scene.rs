//! In-memory scene graph served by the demonstration host.

use serde::Serialize;
use std::collections::BTreeMap;

/// Instance ids are handed out from here so they never look like list indices.
const FIRST_INSTANCE_ID: i64 = 1000;

/// One object in the scene.
#[derive(Debug, Clone)]
struct SceneObject {
    instance_id: i64,
    name: String,
    components: Vec<String>,
    active: bool,
    parent: Option<i64>,
    children: Vec<i64>,
}

/// Short form used in scene listings.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    pub name: String,
    pub instance_id: i64,
}

/// Detailed form returned by `host.getObjectInfo`.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectInfo {
    pub name: String,
    pub instance_id: i64,
    pub components: Vec<String>,
    /// Number of direct children.
    pub children: usize,
    pub active: bool,
}

/// Scene summary returned by `host.getSceneInfo`.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SceneInfo {
    pub name: String,
    pub path: String,
    pub root_objects: Vec<ObjectRef>,
}

#[derive(Debug, Clone)]
pub struct Scene {
    name: String,
    path: String,
    objects: BTreeMap<i64, SceneObject>,
    roots: Vec<i64>,
    next_id: i64,
}

impl Scene {
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            objects: BTreeMap::new(),
            roots: Vec::new(),
            next_id: FIRST_INSTANCE_ID,
        }
    }

    /// The scene the host starts with.
    pub fn demo() -> Self {
        let mut scene = Self::new("Main", "Assets/Scenes/Main.unity");
        scene.add_object("Main Camera", &["Transform", "Camera", "AudioListener"], None);
        scene.add_object("Directional Light", &["Transform", "Light"], None);
        let player = scene.add_object("Player", &["Transform", "Rigidbody", "CapsuleCollider"], None);
        scene.add_object("Weapon", &["Transform", "MeshRenderer"], Some(player));
        scene
    }

    /// Add an object and return its instance id. An unknown parent makes the
    /// object a root.
    pub fn add_object(&mut self, name: &str, components: &[&str], parent: Option<i64>) -> i64 {
        let instance_id = self.next_id;
        self.next_id += 1;

        let parent = parent.filter(|id| self.objects.contains_key(id));
        match parent {
            Some(parent_id) => {
                if let Some(parent) = self.objects.get_mut(&parent_id) {
                    parent.children.push(instance_id);
                }
            }
            None => self.roots.push(instance_id),
        }

        self.objects.insert(
            instance_id,
            SceneObject {
                instance_id,
                name: name.to_string(),
                components: components.iter().map(|c| c.to_string()).collect(),
                active: true,
                parent,
                children: Vec::new(),
            },
        );
        instance_id
    }

    pub fn info(&self) -> SceneInfo {
        SceneInfo {
            name: self.name.clone(),
            path: self.path.clone(),
            root_objects: self
                .roots
                .iter()
                .filter_map(|id| self.objects.get(id))
                .map(|object| ObjectRef {
                    name: object.name.clone(),
                    instance_id: object.instance_id,
                })
                .collect(),
        }
    }

    pub fn object_info(&self, instance_id: i64) -> Option<ObjectInfo> {
        self.objects.get(&instance_id).map(|object| ObjectInfo {
            name: object.name.clone(),
            instance_id: object.instance_id,
            components: object.components.clone(),
            children: object.children.len(),
            active: object.active,
        })
    }

    /// Returns `false` if the object does not exist.
    pub fn set_active(&mut self, instance_id: i64, active: bool) -> bool {
        match self.objects.get_mut(&instance_id) {
            Some(object) => {
                object.active = active;
                true
            }
            None => false,
        }
    }

    pub fn rename(&mut self, instance_id: i64, name: &str) -> bool {
        match self.objects.get_mut(&instance_id) {
            Some(object) => {
                object.name = name.to_string();
                true
            }
            None => false,
        }
    }

    /// Remove an object and its whole subtree. Returns the removed ids,
    /// parent first; empty if the object does not exist.
    pub fn destroy(&mut self, instance_id: i64) -> Vec<i64> {
        let Some(parent) = self.objects.get(&instance_id).map(|o| o.parent) else {
            return Vec::new();
        };

        match parent {
            Some(parent_id) => {
                if let Some(parent) = self.objects.get_mut(&parent_id) {
                    parent.children.retain(|id| *id != instance_id);
                }
            }
            None => self.roots.retain(|id| *id != instance_id),
        }

        let mut removed = Vec::new();
        let mut stack = vec![instance_id];
        while let Some(id) = stack.pop() {
            if let Some(object) = self.objects.remove(&id) {
                stack.extend(object.children.iter().rev());
                removed.push(id);
            }
        }
        removed
    }
}
