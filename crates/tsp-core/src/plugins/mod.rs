//! # Built-in Plugins
//!
//! | kind      | name     | options                                  |
//! |-----------|----------|------------------------------------------|
//! | input     | `file`   | `path` (`-` = stdin), `bitrate`          |
//! | input     | `null`   | `count` (0 = endless), `bitrate`         |
//! | processor | `filter` | `pid` (repeatable), `negate`             |
//! | processor | `skip`   | `packets`                                |
//! | processor | `until`  | `packets`, `joint`                       |
//! | output    | `file`   | `path` (`-` = stdout)                    |
//! | output    | `drop`   |                                          |
//!
//! [`PluginRegistry`] maps these names to factories, so stages built from the
//! registry can be restarted with new options.

use std::collections::HashMap;
use std::sync::Arc;

use crate::plugin::{
    Factory, InputPlugin, OutputPlugin, PluginError, PluginOptions, ProcessorPlugin, StageDef,
};
use crate::{BitRate, StageKind};

mod drop_output;
mod file_input;
mod file_output;
mod filter;
mod null_input;
mod skip;
mod until;

pub use drop_output::DropOutput;
pub use file_input::FileInput;
pub use file_output::FileOutput;
pub use filter::FilterPlugin;
pub use null_input::NullInput;
pub use skip::SkipPlugin;
pub use until::UntilPlugin;

/// Optional `bitrate` option shared by the inputs.
fn bitrate_option(options: &PluginOptions) -> Result<BitRate, PluginError> {
    Ok(options
        .get_parsed::<u64>("bitrate")?
        .map_or(BitRate::UNKNOWN, BitRate::new))
}

/// Wrap a constructor as an input [`Factory`].
pub fn input_factory<P, F>(build: F) -> Factory<dyn InputPlugin>
where
    P: InputPlugin + 'static,
    F: Fn(&PluginOptions) -> Result<P, PluginError> + Send + Sync + 'static,
{
    Arc::new(move |options: &PluginOptions| Ok(Box::new(build(options)?) as Box<dyn InputPlugin>))
}

/// Wrap a constructor as a processor [`Factory`].
pub fn processor_factory<P, F>(build: F) -> Factory<dyn ProcessorPlugin>
where
    P: ProcessorPlugin + 'static,
    F: Fn(&PluginOptions) -> Result<P, PluginError> + Send + Sync + 'static,
{
    Arc::new(move |options: &PluginOptions| {
        Ok(Box::new(build(options)?) as Box<dyn ProcessorPlugin>)
    })
}

/// Wrap a constructor as an output [`Factory`].
pub fn output_factory<P, F>(build: F) -> Factory<dyn OutputPlugin>
where
    P: OutputPlugin + 'static,
    F: Fn(&PluginOptions) -> Result<P, PluginError> + Send + Sync + 'static,
{
    Arc::new(move |options: &PluginOptions| Ok(Box::new(build(options)?) as Box<dyn OutputPlugin>))
}

/// Plugin factories by kind and name.
#[derive(Default, Clone)]
pub struct PluginRegistry {
    inputs: HashMap<&'static str, Factory<dyn InputPlugin>>,
    processors: HashMap<&'static str, Factory<dyn ProcessorPlugin>>,
    outputs: HashMap<&'static str, Factory<dyn OutputPlugin>>,
}

impl PluginRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_input("file", input_factory(FileInput::from_options));
        registry.register_input("null", input_factory(NullInput::from_options));
        registry.register_processor("filter", processor_factory(FilterPlugin::from_options));
        registry.register_processor("skip", processor_factory(SkipPlugin::from_options));
        registry.register_processor("until", processor_factory(UntilPlugin::from_options));
        registry.register_output("file", output_factory(FileOutput::from_options));
        registry.register_output("drop", output_factory(DropOutput::from_options));
        registry
    }

    pub fn register_input(&mut self, name: &'static str, factory: Factory<dyn InputPlugin>) {
        self.inputs.insert(name, factory);
    }

    pub fn register_processor(
        &mut self,
        name: &'static str,
        factory: Factory<dyn ProcessorPlugin>,
    ) {
        self.processors.insert(name, factory);
    }

    pub fn register_output(&mut self, name: &'static str, factory: Factory<dyn OutputPlugin>) {
        self.outputs.insert(name, factory);
    }

    pub fn input_stage(
        &self,
        name: &str,
        options: PluginOptions,
    ) -> Result<StageDef<dyn InputPlugin>, PluginError> {
        let factory = lookup(&self.inputs, name)?;
        StageDef::from_factory(factory, options)
    }

    pub fn processor_stage(
        &self,
        name: &str,
        options: PluginOptions,
    ) -> Result<StageDef<dyn ProcessorPlugin>, PluginError> {
        let factory = lookup(&self.processors, name)?;
        StageDef::from_factory(factory, options)
    }

    pub fn output_stage(
        &self,
        name: &str,
        options: PluginOptions,
    ) -> Result<StageDef<dyn OutputPlugin>, PluginError> {
        let factory = lookup(&self.outputs, name)?;
        StageDef::from_factory(factory, options)
    }

    /// Registered names of one kind, sorted.
    pub fn names(&self, kind: StageKind) -> Vec<&'static str> {
        let mut names: Vec<_> = match kind {
            StageKind::Input => self.inputs.keys().copied().collect(),
            StageKind::Processor => self.processors.keys().copied().collect(),
            StageKind::Output => self.outputs.keys().copied().collect(),
        };
        names.sort_unstable();
        names
    }
}

fn lookup<P: ?Sized>(
    factories: &HashMap<&'static str, Factory<P>>,
    name: &str,
) -> Result<Factory<P>, PluginError> {
    factories
        .get(name)
        .cloned()
        .ok_or_else(|| PluginError::UnknownPlugin(name.to_string()))
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("inputs", &self.names(StageKind::Input))
            .field("processors", &self.names(StageKind::Processor))
            .field("outputs", &self.names(StageKind::Output))
            .finish()
    }
}
