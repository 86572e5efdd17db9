//! # Plugin Traits
//!
//! This module defines the capabilities a stage implementation exposes to the
//! pipeline. Every stage wraps exactly one plugin:
//!
//! - [`InputPlugin`] fills ring slots with packets from a source
//! - [`ProcessorPlugin`] transforms or filters packets in place
//! - [`OutputPlugin`] delivers packets to a sink
//!
//! All three extend [`Plugin`], which carries the lifecycle hooks. Plugins
//! receive their configuration as an opaque [`PluginOptions`] set and validate
//! it themselves; the pipeline never interprets option semantics.
//!
//! ## Usage
//!
//! Implement one of the capability traits and hand the plugin to a
//! [`PipelineBuilder`](crate::PipelineBuilder), either directly or as a
//! [`StageDef`] with a factory when the stage must support restart.
//!

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;
use tracing::warn;
use ts::{TsError, TsPacket};

use crate::{PacketMetadata, StageContext};

/// Errors reported by plugins
#[derive(Error, Debug)]
pub enum PluginError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid value '{value}' for option '{key}': {reason}")]
    InvalidOption {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Missing required option '{0}'")]
    MissingOption(String),

    #[error("Unknown plugin '{0}'")]
    UnknownPlugin(String),

    #[error("Packet error: {0}")]
    Ts(#[from] TsError),

    #[error("Plugin does not support restart")]
    RestartUnsupported,

    #[error("{0}")]
    Other(String),
}

/// Lifecycle shared by every plugin kind.
pub trait Plugin: Send {
    /// Get the name of this plugin for logging and diagnostics.
    fn name(&self) -> &'static str;

    /// Called once on the controller thread before any packet flows, in chain
    /// order. This is where a plugin registers for joint termination.
    fn start(&mut self, _ctx: &StageContext) -> Result<(), PluginError> {
        Ok(())
    }

    /// Called once on the stage thread after its last packet, or before the
    /// plugin is replaced by a restart.
    fn stop(&mut self, _ctx: &StageContext) -> Result<(), PluginError> {
        Ok(())
    }
}

/// A packet source.
pub trait InputPlugin: Plugin {
    /// Fill the front of `packets` with received packets.
    ///
    /// # Arguments
    ///
    /// * `packets` - Free slots; their content is unspecified on entry
    /// * `metadata` - Metadata of the same slots, reset by the pipeline
    ///
    /// # Returns
    ///
    /// The number of packets written at the front of `packets`. Zero means end
    /// of input. An error aborts the whole pipeline.
    fn receive(
        &mut self,
        ctx: &StageContext,
        packets: &mut [TsPacket],
        metadata: &mut [PacketMetadata],
    ) -> Result<usize, PluginError>;

    /// Current estimate of the input bitrate, `BitRate::UNKNOWN` if none.
    fn bitrate(&self) -> crate::BitRate {
        crate::BitRate::UNKNOWN
    }

    /// Handle that makes a blocked [`receive`](Self::receive) return.
    ///
    /// Queried after `start`. The pipeline invokes it from another thread
    /// when it aborts; the interrupted `receive` may return an error. Inputs
    /// whose `receive` never blocks for long need none.
    fn input_aborter(&self) -> Option<InputAborter> {
        None
    }
}

/// Interrupts a blocking input from outside its stage thread.
pub type InputAborter = Arc<dyn Fn() + Send + Sync>;

/// Outcome of [`ProcessorPlugin::process`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// The first `n` packets are kept; the rest become dropped markers.
    Kept(usize),
    /// Like `Kept`, and the stream ends after these packets.
    End(usize),
}

/// An in-place packet transformer.
pub trait ProcessorPlugin: Plugin {
    /// Process a run of packets in place.
    ///
    /// The slice never contains dropped markers. A plugin that removes packets
    /// moves the kept ones (with their metadata) to the front, in order, and
    /// reports how many it kept. It can never grow the run.
    fn process(
        &mut self,
        ctx: &StageContext,
        packets: &mut [TsPacket],
        metadata: &mut [PacketMetadata],
    ) -> Result<ProcessStatus, PluginError>;
}

/// A packet sink.
pub trait OutputPlugin: Plugin {
    /// Deliver a run of packets. The slice never contains dropped markers.
    ///
    /// An error aborts the rest of the batch and the whole pipeline.
    fn send(
        &mut self,
        ctx: &StageContext,
        packets: &[TsPacket],
        metadata: &[PacketMetadata],
    ) -> Result<(), PluginError>;
}

/// Ordered `key=value` options of one stage.
///
/// A key may appear several times; bare flags have an empty value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginOptions {
    entries: Vec<(String, String)>,
}

impl PluginOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((key.into(), value.into()));
    }

    /// Parse command line words: `key=value` or a bare `flag`.
    pub fn parse_args<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut options = Self::new();
        for arg in args {
            let arg = arg.as_ref();
            match arg.split_once('=') {
                Some((key, value)) => options.insert(key, value),
                None => options.insert(arg, ""),
            }
        }
        options
    }

    /// Last value given for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Reject any key not in `known`.
    pub fn expect_only(&self, known: &[&str]) -> Result<(), PluginError> {
        match self.entries.iter().find(|(k, _)| !known.contains(&k.as_str())) {
            Some((key, value)) => Err(PluginError::InvalidOption {
                key: key.clone(),
                value: value.clone(),
                reason: format!("unknown option, expected one of: {}", known.join(", ")),
            }),
            None => Ok(()),
        }
    }

    /// Parse the last value of `key`, if present.
    pub fn get_parsed<T>(&self, key: &str) -> Result<Option<T>, PluginError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        self.get(key)
            .map(|value| {
                value.parse().map_err(|e: T::Err| PluginError::InvalidOption {
                    key: key.to_string(),
                    value: value.to_string(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }

    /// Like [`get_parsed`](Self::get_parsed) for a mandatory option.
    pub fn require<T>(&self, key: &str) -> Result<T, PluginError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        self.get_parsed(key)?
            .ok_or_else(|| PluginError::MissingOption(key.to_string()))
    }
}

impl fmt::Display for PluginOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            if value.is_empty() {
                write!(f, "{key}")?;
            } else {
                write!(f, "{key}={value}")?;
            }
        }
        Ok(())
    }
}

/// Creates a plugin from its options. Needed to restart a stage.
pub type Factory<P> = Arc<dyn Fn(&PluginOptions) -> Result<Box<P>, PluginError> + Send + Sync>;

/// A plugin together with what is needed to recreate it.
pub struct StageDef<P: ?Sized> {
    pub(crate) plugin: Box<P>,
    pub(crate) factory: Option<Factory<P>>,
    pub(crate) options: PluginOptions,
    pub(crate) started: bool,
}

impl<P: Plugin + ?Sized> StageDef<P> {
    /// A stage that cannot be restarted.
    pub fn new(plugin: Box<P>) -> Self {
        Self {
            plugin,
            factory: None,
            options: PluginOptions::new(),
            started: false,
        }
    }

    /// Build the plugin from `options` through `factory`, keeping the factory
    /// for later restarts.
    pub fn from_factory(factory: Factory<P>, options: PluginOptions) -> Result<Self, PluginError> {
        let plugin = factory(&options)?;
        Ok(Self {
            plugin,
            factory: Some(factory),
            options,
            started: false,
        })
    }

    pub fn name(&self) -> &'static str {
        self.plugin.name()
    }

    pub fn options(&self) -> &PluginOptions {
        &self.options
    }

    pub fn is_restartable(&self) -> bool {
        self.factory.is_some()
    }

    pub(crate) fn start(&mut self, ctx: &StageContext) -> Result<(), PluginError> {
        self.plugin.start(ctx)?;
        self.started = true;
        Ok(())
    }

    /// Stop the plugin if it is running.
    pub(crate) fn stop(&mut self, ctx: &StageContext) -> Result<(), PluginError> {
        if !self.started {
            return Ok(());
        }
        self.started = false;
        self.plugin.stop(ctx)
    }

    /// Replace the plugin with a new instance built from `options`.
    ///
    /// On a factory error the current plugin keeps running. A failure to stop
    /// the old plugin or to start the new one leaves the stage without a
    /// running plugin and the caller must abort the stage.
    pub(crate) fn restart(
        &mut self,
        options: PluginOptions,
        ctx: &StageContext,
    ) -> Result<(), PluginError> {
        let factory = self
            .factory
            .as_ref()
            .ok_or(PluginError::RestartUnsupported)?;
        let mut plugin = factory(&options)?;

        if let Err(e) = self.stop(ctx) {
            warn!(
                stage = ctx.index(),
                plugin = self.plugin.name(),
                error = %e,
                "plugin stop failed before restart"
            );
            return Err(e);
        }
        let started = plugin.start(ctx);
        self.plugin = plugin;
        self.options = options;
        started?;
        self.started = true;
        Ok(())
    }
}

impl<P: Plugin + ?Sized> fmt::Debug for StageDef<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageDef")
            .field("plugin", &self.plugin.name())
            .field("options", &self.options)
            .field("restartable", &self.factory.is_some())
            .finish()
    }
}
