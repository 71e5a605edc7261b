use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{CapabilityError, CapabilityId, CapabilityKind};

/// How a capability is executed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Invocation {
    /// Pure metadata, e.g. formats and contexts.
    #[default]
    None,
    /// Script evaluated in the worker's engine session.
    RScript { script: String },
    /// External executable run as a child process.
    Command {
        executable: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

/// Static description of one capability implementation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    pub kind: CapabilityKind,
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    /// Engine libraries loaded into the session before invocation.
    #[serde(default)]
    pub required_libraries: Vec<String>,
    #[serde(default)]
    pub accepted_formats: Vec<String>,
    #[serde(default)]
    pub produced_format: Option<String>,
    #[serde(default)]
    pub invocation: Invocation,
    /// Free-form settings interpreted by the consumer of a kind, e.g. the
    /// point strategy of an optimization method.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

impl CapabilityDescriptor {
    pub fn new(kind: CapabilityKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            version: None,
            required_libraries: Vec::new(),
            accepted_formats: Vec::new(),
            produced_format: None,
            invocation: Invocation::None,
            properties: BTreeMap::new(),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_libraries<I, S>(mut self, libraries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_libraries = libraries.into_iter().map(Into::into).collect();
        self
    }

    pub fn accepting<I, S>(mut self, formats: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.accepted_formats = formats.into_iter().map(Into::into).collect();
        self
    }

    pub fn producing(mut self, format: impl Into<String>) -> Self {
        self.produced_format = Some(format.into());
        self
    }

    pub fn with_invocation(mut self, invocation: Invocation) -> Self {
        self.invocation = invocation;
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn id(&self) -> CapabilityId {
        CapabilityId::new(self.kind, self.name.clone())
    }

    pub fn accepts(&self, format: &str) -> bool {
        self.accepted_formats.iter().any(|accepted| accepted == format)
    }
}

/// Substitutes `{{key}}` placeholders. Unknown keys are an error so a typo in
/// a plugin manifest never reaches the engine as literal braces.
pub fn render_template(
    template: &str,
    values: &BTreeMap<String, String>,
) -> Result<String, CapabilityError> {
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        rendered.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or_else(|| CapabilityError::Template {
            placeholder: after.to_string(),
        })?;
        let key = after[..end].trim();
        let value = values.get(key).ok_or_else(|| CapabilityError::Template {
            placeholder: key.to_string(),
        })?;
        rendered.push_str(value);
        rest = &after[end + 2..];
    }
    rendered.push_str(rest);
    Ok(rendered)
}
