//! Plugin enumeration and resolution over the lilv world.

use lilv::node::Node;
use lilv::plugin::Plugin;
use lilv::World;
use serde::{Deserialize, Serialize};

use crate::error::{HostError, Result};
use crate::features::HOST_FEATURE_URIS;
use crate::urid::uris;

/// Class nodes used to classify ports; built once per world.
pub(crate) struct ClassNodes {
    pub input: Node,
    pub output: Node,
    pub audio: Node,
    pub control: Node,
    pub atom: Node,
    pub midi_event: Node,
    pub minimum_size: Node,
}

impl ClassNodes {
    pub fn new(world: &World) -> Self {
        Self {
            input: world.new_uri(uris::CORE_INPUT_PORT),
            output: world.new_uri(uris::CORE_OUTPUT_PORT),
            audio: world.new_uri(uris::CORE_AUDIO_PORT),
            control: world.new_uri(uris::CORE_CONTROL_PORT),
            atom: world.new_uri(uris::ATOM_PORT),
            midi_event: world.new_uri(uris::MIDI_EVENT),
            minimum_size: world.new_uri(uris::RESIZE_PORT_MINIMUM_SIZE),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInfo {
    pub uri: String,
    pub name: String,
    pub class_label: String,
    pub author: Option<String>,
    pub audio_inputs: usize,
    pub audio_outputs: usize,
    pub control_inputs: usize,
    pub control_outputs: usize,
    pub event_inputs: usize,
    pub event_outputs: usize,
    pub required_features: Vec<String>,
    /// Whether every required feature is one this host offers.
    pub compatible: bool,
}

/// Enumerate the installed plugins, sorted by name.
pub fn scan_plugins(world: &World) -> Vec<PluginInfo> {
    let nodes = ClassNodes::new(world);
    let mut plugins = Vec::new();

    for plugin in world.plugins().iter() {
        if !plugin.verify() {
            continue;
        }
        let Some(uri) = plugin.uri().as_uri().map(String::from) else {
            continue;
        };
        let name = plugin.name().as_str().unwrap_or(&uri).to_string();
        let class_label = plugin
            .class()
            .label()
            .as_str()
            .unwrap_or("Plugin")
            .to_string();
        let author = plugin
            .author_name()
            .and_then(|n| n.as_str().map(String::from));

        let mut info = PluginInfo {
            uri,
            name,
            class_label,
            author,
            audio_inputs: 0,
            audio_outputs: 0,
            control_inputs: 0,
            control_outputs: 0,
            event_inputs: 0,
            event_outputs: 0,
            required_features: Vec::new(),
            compatible: true,
        };

        for port in plugin.iter_ports() {
            let is_input = port.is_a(&nodes.input);
            if port.is_a(&nodes.audio) {
                if is_input {
                    info.audio_inputs += 1;
                } else {
                    info.audio_outputs += 1;
                }
            } else if port.is_a(&nodes.control) {
                if is_input {
                    info.control_inputs += 1;
                } else {
                    info.control_outputs += 1;
                }
            } else if port.is_a(&nodes.atom) {
                if is_input {
                    info.event_inputs += 1;
                } else {
                    info.event_outputs += 1;
                }
            }
        }

        info.required_features = plugin
            .required_features()
            .iter()
            .filter_map(|n| n.as_uri().map(String::from))
            .collect();
        info.compatible = info
            .required_features
            .iter()
            .all(|req| HOST_FEATURE_URIS.contains(&req.as_str()));

        plugins.push(info);
    }

    plugins.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
    log::info!("LV2: found {} plugins", plugins.len());
    plugins
}

/// Resolve a plugin by URI.
pub fn resolve_plugin(world: &World, uri: &str) -> Result<Plugin> {
    let uri_node = world.new_uri(uri);
    world
        .plugins()
        .plugin(&uri_node)
        .filter(|p| p.verify())
        .ok_or_else(|| HostError::PluginNotFound(uri.to_string()))
}
