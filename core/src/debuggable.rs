//! Debug state introspection for frontends
//!
//! Peripherals expose their internal state as a tree of named properties
//! that a debugger view can render without knowing the peripheral's type.

use std::borrow::Cow;

pub type DebugProperties = Vec<DebugProperty>;

pub struct DebugProperty {
    name: Cow<'static, str>,
    value: DebugValue,
}

pub enum DebugValue {
    Flag(bool),
    Byte(u8),
    Count(u64),
    Tag(&'static str),
    Text(String),
    Nested(DebugProperties),
}

impl DebugProperty {
    fn new(name: impl Into<Cow<'static, str>>, value: DebugValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    pub fn flag(name: impl Into<Cow<'static, str>>, val: bool) -> Self {
        Self::new(name, DebugValue::Flag(val))
    }

    pub fn byte(name: impl Into<Cow<'static, str>>, val: u8) -> Self {
        Self::new(name, DebugValue::Byte(val))
    }

    pub fn count(name: impl Into<Cow<'static, str>>, val: u64) -> Self {
        Self::new(name, DebugValue::Count(val))
    }

    /// A static string, e.g. an enum variant name
    pub fn tag(name: impl Into<Cow<'static, str>>, val: &'static str) -> Self {
        Self::new(name, DebugValue::Tag(val))
    }

    pub fn text(name: impl Into<Cow<'static, str>>, val: String) -> Self {
        Self::new(name, DebugValue::Text(val))
    }

    pub fn nested(name: impl Into<Cow<'static, str>>, val: DebugProperties) -> Self {
        Self::new(name, DebugValue::Nested(val))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &DebugValue {
        &self.value
    }
}

pub trait Debuggable {
    fn debug_properties(&self) -> DebugProperties;
}
