//! Minimal, tolerant loader over the `arsdk-xml/xml` directory convention
//! (spec.md §6): `generic.xml` first, then every other `*.xml` file
//! alphabetically. The real ARSDK schema grammar is large, independently
//! versioned, and explicitly out of scope (spec.md treats "parsing" as
//! delegated) — this loader implements the small subset of the grammar
//! (project/feature -> class -> command -> argument, with list-kind and
//! buffer-kind attributes) that is sufficient to build a [`super::Catalogue`],
//! on top of `roxmltree`, the corpus's own XML crate for exactly this kind
//! of tree walk.
//!
//! Unknown elements and attributes are skipped rather than rejected:
//! schema evolution in newer XML trees must not break an older client
//! built against this loader.

use std::path::Path;

use roxmltree::Node;

use super::{Argument, BufferKind, CatalogueBuilder, CommandDef, ListKind, ScalarKind, TimeoutPolicy};

#[derive(Debug, thiserror::Error)]
pub enum XmlLoadError {
    #[error("failed to read schema directory {path}: {source}")]
    ReadDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read schema file {path}: {source}")]
    ReadFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse schema file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: roxmltree::Error,
    },
    #[error("{context}: unknown argument type {type_name:?}")]
    UnknownArgType { context: String, type_name: String },
}

/// Loads every `*.xml` file directly under `dir`, `generic.xml` first and
/// the rest alphabetically, registering each project/feature's commands
/// into `builder`.
pub fn load_dir(dir: impl AsRef<Path>, builder: &mut CatalogueBuilder) -> Result<(), super::SchemaError> {
    let dir = dir.as_ref();
    let mut entries: Vec<_> = std::fs::read_dir(dir)
        .map_err(|e| XmlLoadError::ReadDir {
            path: dir.display().to_string(),
            source: e,
        })?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "xml"))
        .collect();

    entries.sort_by_key(|p| {
        let is_generic = p.file_name().and_then(|n| n.to_str()) == Some("generic.xml");
        (!is_generic, p.clone())
    });

    for path in entries {
        load_file(&path, builder)?;
    }

    Ok(())
}

fn load_file(path: &Path, builder: &mut CatalogueBuilder) -> Result<(), super::SchemaError> {
    let text = std::fs::read_to_string(path).map_err(|e| XmlLoadError::ReadFile {
        path: path.display().to_string(),
        source: e,
    })?;

    let doc = roxmltree::Document::parse(&text).map_err(|e| XmlLoadError::Parse {
        path: path.display().to_string(),
        source: e,
    })?;

    let root = doc.root_element();
    let is_feature = root.has_tag_name("feature");

    let project_name = root
        .attribute("name")
        .unwrap_or_default()
        .to_owned();
    let project_id = attr_u8(&root, "id").unwrap_or(0);

    if is_feature {
        load_feature(&root, &project_name, project_id, builder)?;
    } else {
        load_project(&root, &project_name, project_id, builder)?;
    }

    Ok(())
}

fn load_project(
    root: &Node,
    project_name: &str,
    project_id: u8,
    builder: &mut CatalogueBuilder,
) -> Result<(), super::SchemaError> {
    for class_node in root.children().filter(|n| n.has_tag_name("class")) {
        let class_name = class_node.attribute("name").unwrap_or_default().to_owned();
        let class_id = attr_u8(&class_node, "id").unwrap_or(0);

        for cmd_node in class_node.children().filter(|n| n.has_tag_name("cmd")) {
            let def = parse_command(
                &cmd_node,
                project_name,
                project_id,
                &class_name,
                class_id,
            )?;
            builder.add_project_command(def)?;
        }
    }

    Ok(())
}

fn load_feature(
    root: &Node,
    project_name: &str,
    project_id: u8,
    builder: &mut CatalogueBuilder,
) -> Result<(), super::SchemaError> {
    for cmd_node in root.children().filter(|n| n.has_tag_name("cmd")) {
        let def = parse_command(&cmd_node, project_name, project_id, "", 0)?;
        builder.add_feature_command(def)?;
    }

    for evt_node in root.children().filter(|n| n.has_tag_name("evt")) {
        let def = parse_command(&evt_node, project_name, project_id, "", 0)?;
        builder.add_feature_command(def)?;
    }

    Ok(())
}

fn parse_command(
    node: &Node,
    project_name: &str,
    project_id: u8,
    class_name: &str,
    class_id: u8,
) -> Result<CommandDef, super::SchemaError> {
    let cmd_name = node.attribute("name").unwrap_or_default().to_owned();
    let cmd_id = attr_u16(node, "id").unwrap_or(0);

    let list_kind = match node.attribute("list_type") {
        Some("LIST") => ListKind::List,
        Some("MAP") => ListKind::Map,
        _ => ListKind::None,
    };

    let buffer_kind = match node.attribute("buffer") {
        Some("ACK") => BufferKind::Ack,
        Some("HIGH_PRIO") => BufferKind::HighPrio,
        _ => BufferKind::NonAck,
    };

    let timeout_policy = TimeoutPolicy(node.attribute("timeout").map(str::to_owned));

    let mut args = Vec::new();
    for arg_node in node.children().filter(|n| n.has_tag_name("arg")) {
        let name = arg_node.attribute("name").unwrap_or_default().to_owned();
        let type_str = arg_node.attribute("type").unwrap_or("u8");
        let kind = parse_scalar_kind(type_str).map_err(|_| {
            super::SchemaError::Xml(XmlLoadError::UnknownArgType {
                context: format!("{project_name}.{class_name}.{cmd_name}"),
                type_name: type_str.to_owned(),
            })
        })?;
        args.push(Argument { name, kind });
    }

    Ok(CommandDef {
        project_id,
        class_id,
        cmd_id,
        project_name: project_name.to_owned(),
        class_name: class_name.to_owned(),
        cmd_name,
        args,
        list_kind,
        buffer_kind,
        timeout_policy,
    })
}

/// Bitfields serialise as their underlying integer kind, enums as `i32`
/// (spec.md §3) — `enum` and any `bitfield:<kind>` both resolve through
/// here rather than being a separate case in the caller.
fn parse_scalar_kind(type_str: &str) -> Result<ScalarKind, ()> {
    let underlying = type_str
        .strip_prefix("bitfield:")
        .unwrap_or(type_str);

    Ok(match underlying {
        "i8" => ScalarKind::I8,
        "u8" => ScalarKind::U8,
        "i16" => ScalarKind::I16,
        "u16" => ScalarKind::U16,
        "i32" => ScalarKind::I32,
        "u32" => ScalarKind::U32,
        "i64" => ScalarKind::I64,
        "u64" => ScalarKind::U64,
        "float" | "f32" => ScalarKind::F32,
        "double" | "f64" => ScalarKind::F64,
        "enum" => ScalarKind::Enum,
        "string" => ScalarKind::String,
        _ => return Err(()),
    })
}

fn attr_u8(node: &Node, name: &str) -> Option<u8> {
    node.attribute(name).and_then(|v| parse_maybe_hex(v))
}

fn attr_u16(node: &Node, name: &str) -> Option<u16> {
    node.attribute(name).and_then(|v| parse_maybe_hex(v))
}

fn parse_maybe_hex<T>(value: &str) -> Option<T>
where
    T: TryFrom<u64>,
{
    let n = if let Some(hex) = value.strip_prefix("0x") {
        u64::from_str_radix(hex, 16).ok()?
    } else {
        value.parse().ok()?
    };
    T::try_from(n).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Catalogue;

    #[test]
    fn parses_a_minimal_project_xml() {
        let xml = r#"
            <project name="common" id="0">
              <class name="Common" id="0">
                <cmd name="CurrentDate" id="4">
                  <arg name="date" type="string"/>
                </cmd>
              </class>
            </project>
        "#;

        let doc = roxmltree::Document::parse(xml).unwrap();
        let mut builder = Catalogue::builder();
        load_project(&doc.root_element(), "common", 0, &mut builder).unwrap();
        let catalogue = builder.build().unwrap();

        let def = catalogue
            .find_by_name("common", "Common", "CurrentDate")
            .unwrap();
        assert_eq!(def.args[0].kind, ScalarKind::String);
    }

    #[test]
    fn parses_a_minimal_feature_xml_with_evt() {
        let xml = r#"
            <feature name="battery" id="5">
              <evt name="Level" id="1">
                <arg name="percent" type="u8"/>
              </evt>
            </feature>
        "#;

        let doc = roxmltree::Document::parse(xml).unwrap();
        let mut builder = Catalogue::builder();
        load_feature(&doc.root_element(), "battery", 5, &mut builder).unwrap();
        let catalogue = builder.build().unwrap();

        assert!(catalogue.find_feature_by_id(5, 1).is_some());
    }

    #[test]
    fn bitfield_resolves_to_underlying_kind() {
        assert_eq!(parse_scalar_kind("bitfield:u32").unwrap(), ScalarKind::U32);
        assert_eq!(parse_scalar_kind("enum").unwrap(), ScalarKind::Enum);
    }
}
