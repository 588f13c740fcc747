use clap::{ArgAction, Parser};

#[derive(Parser)]
#[command(name = "amdovc")]
#[command(about = "Overclock and monitor AMD GPUs from the console")]
#[command(version)]
pub struct Cli {
    /// Restrict the adapter report to this list ("all", or e.g. 0,2-3)
    #[arg(short, long, value_name = "LIST")]
    pub adapters: Option<String>,

    /// Increase verbosity (-v = verbose report and info logs, -vv = debug, -vvv = trace)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Parameters to apply, e.g. coreclk:1:2=1000 fanspeed=75.
    /// With no parameters a per-adapter report is printed instead.
    #[arg(value_name = "PARAM")]
    pub params: Vec<String>,
}
