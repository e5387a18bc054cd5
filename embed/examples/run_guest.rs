//! Example: loading a guest module and calling one of its exports.
//!
//! ```text
//! cargo run --example run_guest -- embed/guests/math.wat fibonacci 20
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wasm_embed::{LoadOptions, ModuleInstance, Runtime, RuntimeConfig};

#[derive(Parser, Debug)]
#[command(name = "run_guest")]
#[command(about = "Load a WebAssembly guest and call an exported function")]
struct Cli {
    /// Path to a .wasm or .wat module
    module: PathBuf,

    /// Exported function to call
    function: String,

    /// Argument cells (32-bit words)
    args: Vec<u32>,

    /// Runtime pool size in bytes
    #[arg(long, default_value_t = wasm_embed::DEFAULT_POOL_SIZE)]
    pool: usize,

    /// Guest execution stack budget in bytes
    #[arg(long, default_value_t = wasm_embed::DEFAULT_STACK_BUDGET)]
    stack: usize,

    /// Guest heap budget in bytes
    #[arg(long, default_value_t = wasm_embed::DEFAULT_HEAP_BUDGET)]
    heap: usize,

    /// Host-side stack for the call thread in bytes
    #[arg(long, default_value_t = wasm_embed::DEFAULT_THREAD_STACK_BUDGET)]
    thread_stack: usize,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wasm_embed=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut runtime = Runtime::new(RuntimeConfig::default());
    runtime.initialize(cli.pool)?;

    ModuleInstance::set_thread_stack_budget(cli.thread_stack);
    {
        let mut module = ModuleInstance::new(&runtime);
        let options = LoadOptions {
            stack_budget: cli.stack,
            heap_budget: cli.heap,
        };
        module.load_file(&cli.module, options)?;
        println!("exports: {}", module.exports().join(", "));

        // Leave room for the result even when the function takes no arguments.
        let mut args = cli.args.clone();
        if args.is_empty() {
            args.push(0);
        }
        module.call(&cli.function, &mut args)?;
        println!("{}({:?}) = {}", cli.function, cli.args, module.result());
    }

    runtime.log_memory_usage();
    runtime.shutdown();
    Ok(())
}
