use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("plugrpc {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    println!("name: plugrpc");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!("protocol: {} {}", plugrpc_peer::PROTOCOL_NAME, plugrpc_peer::PROTOCOL_VERSION);
    println!(
        "build_target: {}",
        option_env!("PLUGRPC_BUILD_TARGET").unwrap_or("unknown")
    );
    println!("target_os: {}", std::env::consts::OS);
    println!("target_arch: {}", std::env::consts::ARCH);
    println!("git_hash: {}", option_env!("GIT_HASH").unwrap_or("unknown"));
    println!("features: worker={}, cli=true", cfg!(feature = "worker"));

    Ok(SUCCESS)
}
