use std::path::PathBuf;

use clap::{Parser, Subcommand};
use colored::Colorize;
use tokio::net::UnixStream;

use desd_protocol::{control_registry, Client, Reply};

/// Control client for a running desd instance
#[derive(Parser, Debug)]
#[command(name = "desd-ctl")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the desd control socket
    #[arg(long = "socket", default_value = "desd.sock")]
    socket: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Liveness probe: the server echoes the arguments back
    Echo {
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },
    /// Run a named action on a service and wait for it to complete
    Action { service: String, action: String },
    /// Drive a kill script (signals and wait seconds) against a service
    Kill {
        service: String,
        #[arg(required = true)]
        script: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let stream = match UnixStream::connect(&cli.socket).await {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!(
                "{} cannot connect to {}: {}",
                "error:".red().bold(),
                cli.socket.display(),
                e
            );
            std::process::exit(1);
        }
    };
    let client = Client::new(stream, control_registry(), None);

    let result = match &cli.command {
        Commands::Echo { args } => client.call("echo", args.clone()).await,
        Commands::Action { service, action } => {
            client
                .call("service_action", [service.clone(), action.clone()])
                .await
        }
        Commands::Kill { service, script } => {
            client
                .call("killscript", [service.clone(), script.join(" ")])
                .await
        }
    };

    let reply = match result {
        Ok(reply) => reply,
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            std::process::exit(1);
        }
    };

    render(&reply);
    std::process::exit(exit_code(&cli.command, &reply));
}

fn render(reply: &Reply) {
    let rest = reply.args().join(" ");
    if reply.is_ok() {
        if rest.is_empty() {
            println!("{}", "ok".green());
        } else {
            println!("{} {}", "ok".green(), rest);
        }
    } else {
        eprintln!("{} {}", "error".red(), rest);
    }
}

/// Exit 0 on ok, 2 when a kill script ran dry, 1 otherwise.
fn exit_code(command: &Commands, reply: &Reply) -> i32 {
    if reply.is_ok() {
        return 0;
    }
    let kind = reply.args().first().map(String::as_str);
    match command {
        Commands::Kill { .. } if kind == Some("still_running") => 2,
        _ => 1,
    }
}
