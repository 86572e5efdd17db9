use tsp_core::{PluginOptions, StageKind};

use crate::error::AppError;

/// One `-I`, `-P` or `-O` segment of the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSpec {
    pub kind: StageKind,
    pub name: String,
    pub options: PluginOptions,
}

impl StageSpec {
    fn new(kind: StageKind, name: impl Into<String>, options: PluginOptions) -> Self {
        Self {
            kind,
            name: name.into(),
            options,
        }
    }

    /// `file path=-`
    fn standard_stream(kind: StageKind) -> Self {
        Self::new(kind, "file", PluginOptions::new().with("path", "-"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainSpec {
    pub input: StageSpec,
    pub processors: Vec<StageSpec>,
    pub output: StageSpec,
}

fn stage_kind(word: &str) -> Option<StageKind> {
    match word {
        "-I" => Some(StageKind::Input),
        "-P" => Some(StageKind::Processor),
        "-O" => Some(StageKind::Output),
        _ => None,
    }
}

/// Split the trailing command line words into plugin stages.
pub fn parse_chain<S: AsRef<str>>(words: &[S]) -> Result<ChainSpec, AppError> {
    let mut input = None;
    let mut processors = Vec::new();
    let mut output = None;

    let mut words = words.iter().map(AsRef::as_ref).peekable();
    while let Some(word) = words.next() {
        let kind = stage_kind(word).ok_or_else(|| {
            AppError::InvalidInput(format!("expected -I, -P or -O, found '{word}'"))
        })?;
        let name = match words.next() {
            Some(name) if stage_kind(name).is_none() => name,
            _ => {
                return Err(AppError::InvalidInput(format!(
                    "missing plugin name after {word}"
                )));
            }
        };

        let mut options = Vec::new();
        while let Some(option) = words.next_if(|w| stage_kind(w).is_none()) {
            options.push(option);
        }
        let stage = StageSpec::new(kind, name, PluginOptions::parse_args(options));

        match kind {
            StageKind::Input if input.is_some() => {
                return Err(AppError::InvalidInput("only one input plugin (-I) is allowed".into()));
            }
            StageKind::Output if output.is_some() => {
                return Err(AppError::InvalidInput("only one output plugin (-O) is allowed".into()));
            }
            StageKind::Input => input = Some(stage),
            StageKind::Processor => processors.push(stage),
            StageKind::Output => output = Some(stage),
        }
    }

    Ok(ChainSpec {
        input: input.unwrap_or_else(|| StageSpec::standard_stream(StageKind::Input)),
        processors,
        output: output.unwrap_or_else(|| StageSpec::standard_stream(StageKind::Output)),
    })
}
