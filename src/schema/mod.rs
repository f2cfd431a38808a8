//! Command catalogue: the immutable, schema-derived description of every
//! project/feature, class, and command the codec knows how to encode and
//! decode.
//!
//! The real schema grammar lives in the `arsdk-xml` tree and is an
//! independently-versioned external artifact (spec.md treats parsing it as
//! delegated). What matters to the rest of this crate is the shape in
//! §3: a catalogue indexed both by numeric id and by name, handed around
//! as an `Arc<Catalogue>` rather than a process-global singleton.

pub mod xml;

use std::collections::HashMap;

/// The scalar wire kinds a command argument can have. Bitfields serialise
/// as their underlying integer kind; enums always as `i32` (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    Enum,
    String,
}

/// How repeated arrivals of a command update the device-state store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListKind {
    None,
    List,
    Map,
}

/// Schema-recommended delivery semantics, mapped to a transport buffer by
/// the orchestrator (spec.md §4.E).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    NonAck,
    Ack,
    HighPrio,
}

/// Opaque timeout-policy hint carried through unchanged from the schema
/// to the orchestrator; spec.md never defines its values beyond "a hint".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct TimeoutPolicy(pub Option<String>);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Argument {
    pub name: String,
    pub kind: ScalarKind,
}

#[derive(Debug, Clone)]
pub struct CommandDef {
    pub project_id: u8,
    pub class_id: u8,
    pub cmd_id: u16,
    pub project_name: String,
    pub class_name: String,
    pub cmd_name: String,
    pub args: Vec<Argument>,
    pub list_kind: ListKind,
    pub buffer_kind: BufferKind,
    pub timeout_policy: TimeoutPolicy,
}

/// Whether a `(project_id, cmd_id)` pair found in a feature's id table was
/// registered as a command or as an event. Both share the same `cmd_id`
/// namespace on the wire (spec.md §4.C); only the decode path needs to
/// know which table matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FeatureSlot {
    Command,
    Event,
}

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("duplicate command id ({project_id}, {class_id}, {cmd_id}) for {project_name}.{class_name}.{cmd_name}")]
    DuplicateId {
        project_id: u8,
        class_id: u8,
        cmd_id: u16,
        project_name: String,
        class_name: String,
        cmd_name: String,
    },
    #[error("duplicate command name {project_name}.{class_name}.{cmd_name}")]
    DuplicateName {
        project_name: String,
        class_name: String,
        cmd_name: String,
    },
    #[error("project and feature names collide: {0}")]
    NameCollision(String),
    #[error(transparent)]
    Xml(#[from] xml::XmlLoadError),
}

/// Immutable catalogue of every known command, indexed both by numeric
/// id (for decode) and by name (for encode). Built once via
/// [`CatalogueBuilder`] and then shared by `Arc` — this is the fix for
/// the source's module-level global catalogue (spec.md §9).
#[derive(Debug, Default)]
pub struct Catalogue {
    /// `project_id` doubles as the feature id; both share the `u8`
    /// namespace on the wire (spec.md §4.C), so a lookup by id always
    /// checks both maps.
    by_id: HashMap<(u8, u8, u16), usize>,
    /// Feature commands/events indexed by `(project_id, cmd_id)` alone
    /// (features have no class level).
    feature_by_id: HashMap<(u8, u16), (usize, FeatureSlot)>,
    by_name: HashMap<(String, String, String), usize>,
    /// project/feature name -> is-it-a-feature (class_id always 0 for
    /// features), used to resolve encode()'s two-table project lookup.
    project_kind: HashMap<String, bool>,
    /// (project, class) names known to have at least one command, so
    /// `Codec::encode` can tell "unknown class" from "unknown command in
    /// a known class" apart, as the original source's two distinct
    /// `CommandError` messages do.
    classes: std::collections::HashSet<(String, String)>,
    commands: Vec<CommandDef>,
}

impl Catalogue {
    pub fn builder() -> CatalogueBuilder {
        CatalogueBuilder::default()
    }

    /// Loads the catalogue from an `arsdk-xml/xml`-shaped directory:
    /// `generic.xml` first, then every other `*.xml` alphabetically
    /// (spec.md §6).
    pub fn from_xml_dir(dir: impl AsRef<std::path::Path>) -> Result<Self, SchemaError> {
        let mut builder = Self::builder();
        xml::load_dir(dir, &mut builder)?;
        builder.build()
    }

    /// Is `name` a known feature (flat namespace, no class level)?
    pub fn is_feature(&self, project: &str) -> Option<bool> {
        self.project_kind.get(project).copied()
    }

    pub fn find_by_name(&self, project: &str, class: &str, command: &str) -> Option<&CommandDef> {
        self.by_name
            .get(&(project.to_owned(), class.to_owned(), command.to_owned()))
            .map(|&idx| &self.commands[idx])
    }

    /// Whether `(project, class)` has at least one registered command.
    /// Only meaningful for projects; features have no class level.
    pub fn has_class(&self, project: &str, class: &str) -> bool {
        self.classes.contains(&(project.to_owned(), class.to_owned()))
    }

    /// Resolves a decoded `(project_id, class_id, cmd_id)` triple for a
    /// project (non-feature) command.
    pub fn find_project_by_id(&self, project_id: u8, class_id: u8, cmd_id: u16) -> Option<&CommandDef> {
        self.by_id
            .get(&(project_id, class_id, cmd_id))
            .map(|&idx| &self.commands[idx])
    }

    /// Resolves a decoded `(project_id, cmd_id)` pair against a feature's
    /// merged command/event id table, per spec.md §4.C.
    pub fn find_feature_by_id(&self, project_id: u8, cmd_id: u16) -> Option<&CommandDef> {
        self.feature_by_id
            .get(&(project_id, cmd_id))
            .map(|&(idx, _)| &self.commands[idx])
    }

    /// True if `project_id` is registered at all, in either table
    /// (spec.md §4.C: "the `u8` id space is shared ... in the wire
    /// format").
    pub fn has_project_id(&self, project_id: u8) -> bool {
        self.by_id.keys().any(|&(p, _, _)| p == project_id)
            || self.feature_by_id.keys().any(|&(p, _)| p == project_id)
    }
}

/// Accumulates command definitions before the catalogue is frozen.
#[derive(Debug, Default)]
pub struct CatalogueBuilder {
    commands: Vec<CommandDef>,
    project_kind: HashMap<String, bool>,
}

impl CatalogueBuilder {
    /// Registers a project (classed) command.
    pub fn add_project_command(&mut self, def: CommandDef) -> Result<(), SchemaError> {
        self.register(def, false)
    }

    /// Registers a feature (flat, `class_id = 0`) command or event.
    pub fn add_feature_command(&mut self, def: CommandDef) -> Result<(), SchemaError> {
        self.register(def, true)
    }

    fn register(&mut self, def: CommandDef, is_feature: bool) -> Result<(), SchemaError> {
        match self.project_kind.get(&def.project_name) {
            Some(&existing) if existing != is_feature => {
                return Err(SchemaError::NameCollision(def.project_name.clone()));
            }
            _ => {
                self.project_kind.insert(def.project_name.clone(), is_feature);
            }
        }
        self.commands.push(def);
        Ok(())
    }

    pub fn build(self) -> Result<Catalogue, SchemaError> {
        let mut by_id = HashMap::new();
        let mut feature_by_id = HashMap::new();
        let mut by_name = HashMap::new();
        let mut classes = std::collections::HashSet::new();

        for (idx, def) in self.commands.iter().enumerate() {
            let is_feature = self.project_kind[&def.project_name];

            let name_key = (def.project_name.clone(), def.class_name.clone(), def.cmd_name.clone());
            if by_name.insert(name_key, idx).is_some() {
                return Err(SchemaError::DuplicateName {
                    project_name: def.project_name.clone(),
                    class_name: def.class_name.clone(),
                    cmd_name: def.cmd_name.clone(),
                });
            }

            if is_feature {
                let id_key = (def.project_id, def.cmd_id);
                if feature_by_id
                    .insert(id_key, (idx, FeatureSlot::Command))
                    .is_some()
                {
                    return Err(SchemaError::DuplicateId {
                        project_id: def.project_id,
                        class_id: def.class_id,
                        cmd_id: def.cmd_id,
                        project_name: def.project_name.clone(),
                        class_name: def.class_name.clone(),
                        cmd_name: def.cmd_name.clone(),
                    });
                }
            } else {
                let id_key = (def.project_id, def.class_id, def.cmd_id);
                if by_id.insert(id_key, idx).is_some() {
                    return Err(SchemaError::DuplicateId {
                        project_id: def.project_id,
                        class_id: def.class_id,
                        cmd_id: def.cmd_id,
                        project_name: def.project_name.clone(),
                        class_name: def.class_name.clone(),
                        cmd_name: def.cmd_name.clone(),
                    });
                }
                classes.insert((def.project_name.clone(), def.class_name.clone()));
            }
        }

        Ok(Catalogue {
            by_id,
            feature_by_id,
            by_name,
            project_kind: self.project_kind,
            classes,
            commands: self.commands,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date_cmd() -> CommandDef {
        CommandDef {
            project_id: 0,
            class_id: 0,
            cmd_id: 4,
            project_name: "common".into(),
            class_name: "Common".into(),
            cmd_name: "CurrentDate".into(),
            args: vec![Argument {
                name: "date".into(),
                kind: ScalarKind::String,
            }],
            list_kind: ListKind::None,
            buffer_kind: BufferKind::Ack,
            timeout_policy: TimeoutPolicy::default(),
        }
    }

    #[test]
    fn finds_project_command_by_name_and_id() {
        let mut builder = Catalogue::builder();
        builder.add_project_command(date_cmd()).unwrap();
        let catalogue = builder.build().unwrap();

        assert!(catalogue.find_by_name("common", "Common", "CurrentDate").is_some());
        assert!(catalogue.find_project_by_id(0, 0, 4).is_some());
        assert_eq!(catalogue.is_feature("common"), Some(false));
    }

    #[test]
    fn rejects_duplicate_ids() {
        let mut builder = Catalogue::builder();
        builder.add_project_command(date_cmd()).unwrap();
        let mut dup = date_cmd();
        dup.cmd_name = "Other".into();
        builder.add_project_command(dup).unwrap();

        assert!(matches!(builder.build(), Err(SchemaError::DuplicateId { .. })));
    }

    #[test]
    fn feature_and_project_share_id_space() {
        let mut builder = Catalogue::builder();
        builder.add_project_command(date_cmd()).unwrap();

        let mut feat = date_cmd();
        feat.project_name = "battery".into();
        feat.class_name.clear();
        feat.cmd_name = "Level".into();
        builder.add_feature_command(feat).unwrap();

        let catalogue = builder.build().unwrap();
        assert!(catalogue.has_project_id(0));
        assert_eq!(catalogue.is_feature("battery"), Some(true));
    }
}
