use clap::Parser as ClapParser;
use std::process;

use hdebug::{
    Context, DebugContext, DebugCreateInfo, Error, HostContext, NativeMethod,
    ProtectionStrategy, SimpleHost,
};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// How closed handles' raw data is made unusable
    #[arg(long, value_enum, default_value_t = ProtectionStrategy::CanaryFill)]
    protection: ProtectionStrategy,

    /// Closed handles kept quarantined before reclaim
    #[arg(long, help = "Number of closed handles kept in quarantine")]
    quarantine_size: Option<usize>,

    /// Frames captured per opened handle, 0 disables capture
    #[arg(long, help = "Stack frames recorded per allocation")]
    stack_trace_limit: Option<usize>,

    /// Handles the demo leaves open on purpose
    #[arg(long, default_value_t = 0, help = "Number of handles to leak")]
    leak: usize,
}

// builds a namespace describing `this`, and forgets `leak` strings on the way
fn describe<C: Context>(
    ctx: &C,
    this: C::Handle,
    args: &[C::Handle],
) -> Result<C::Handle, Error> {
    let leak = match args.first() {
        Some(&n) => ctx.long_as_i64(n)?.max(0),
        None => 0,
    };

    let ns = ctx.namespace_new()?;
    let name = ctx.type_name(this)?;
    let kind = ctx.unicode_from_str(&name)?;
    ctx.set_attr(ns, "kind", kind)?;
    ctx.close(kind)?;

    let repr = ctx.repr(this)?;
    let text = ctx.unicode_as_utf8(repr)?;
    // SAFETY: `repr` is still open
    let len = unsafe { text.as_bytes() }.len();
    ctx.close(repr)?;
    let size = ctx.list_new(0)?;
    let len = ctx.long_from_i64(len as i64)?;
    ctx.list_append(size, len)?;
    ctx.close(len)?;
    ctx.set_attr(ns, "repr_len", size)?;
    ctx.close(size)?;

    for i in 0..leak {
        let _forgotten = ctx.unicode_from_str(&format!("leaked #{i}"))?;
    }
    Ok(ns)
}

fn run(cli: &Cli) -> Result<(), Error> {
    let ctx = DebugContext::with_settings(
        SimpleHost::new(),
        &DebugCreateInfo {
            protection: Some(cli.protection),
            quarantine_size: cli.quarantine_size,
            stack_trace_limit: cli.stack_trace_limit,
        },
    )?;
    let host = ctx.host();
    let this = host.tuple_from_array(&[
        host.long_from_i64(1)?,
        host.float_from_f64(2.5)?,
        host.unicode_from_str("three")?,
    ])?;
    let leak = host.long_from_i64(cli.leak as i64)?;

    let mut detector = ctx.leak_detector();
    let method = NativeMethod::VarArgs(describe::<DebugContext<SimpleHost>>);
    let result =
        detector.run(|| ctx.call_real_function(method, this, &[leak]))?;
    println!("{}", host.describe(result).unwrap_or_default());
    host.close(result)?;
    Ok(())
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    match run(&cli) {
        Ok(()) => {}
        Err(Error::Leak(report)) => {
            eprintln!("{report}");
            process::exit(1);
        }
        Err(err) => {
            eprintln!("Error: {err}");
            process::exit(2);
        }
    }
}
