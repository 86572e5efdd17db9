use clap::Parser;
use std::path::PathBuf;

/// Define CLI arguments
#[derive(Parser, Debug)]
#[command(
    author = "hua0512 <https://github.com/hua0512>",
    version,
    about = "Transport stream packet processor",
    long_about = "Runs a chain of transport stream plugins, each on its own thread, sharing\n\
                  one packet ring.\n\
                  \n\
                  The chain is one input, any number of processors and one output:\n\
                  \n\
                  tsp [OPTIONS] -I <name> [opts..] -P <name> [opts..] ... -O <name> [opts..]\n\
                  \n\
                  Plugin options are key=value words or bare flags. The input defaults to\n\
                  'file path=-' (stdin) and the output to 'file path=-' (stdout)."
)]
pub struct CliArgs {
    /// Ring capacity in packets
    #[arg(
        short = 'b',
        long,
        help = "Size of the shared packet ring, in 188-byte packets (default: 16 MiB worth)"
    )]
    pub buffer_packets: Option<usize>,

    /// Stage inactivity timeout with optional unit (ms, s, m, h)
    #[arg(
        short = 't',
        long,
        help = "Abort when a stage waits longer than this for packets. Examples: \"5s\", \"500ms\". Use 0 for none."
    )]
    pub timeout: Option<String>,

    /// Packets per input call
    #[arg(long, help = "Maximum packets requested from the input plugin per call")]
    pub max_input_packets: Option<usize>,

    /// Packets per processor batch
    #[arg(long, help = "Maximum packets a processor handles before passing them on")]
    pub max_flushed_packets: Option<usize>,

    /// Packets per output call
    #[arg(long, help = "Maximum packets per output call, 0 for unlimited")]
    pub max_output_packets: Option<usize>,

    /// Enable verbose logging
    #[arg(short, long, help = "Enable detailed debug logging")]
    pub verbose: bool,

    /// Also write logs to a file
    #[arg(long, help = "Copy log output into this file")]
    pub log_file: Option<PathBuf>,

    /// List the built-in plugins and exit
    #[arg(long, help = "List available plugins and exit")]
    pub list_plugins: bool,

    /// Plugin chain
    #[arg(
        trailing_var_arg = true,
        allow_hyphen_values = true,
        value_name = "CHAIN",
        help = "Plugin chain: -I <name> [opts..] -P <name> [opts..] -O <name> [opts..]"
    )]
    pub chain: Vec<String>,
}
