//! Interface command - show the port methods published on the bus

use crate::cli::args::{InterfaceArgs, OutputFormat};
use crate::error::SerialBusResult;
use crate::session::PORT_INTERFACE_SPEC;
use console::style;

/// Execute the interface command
pub async fn execute(args: InterfaceArgs) -> SerialBusResult<()> {
    match args.format {
        OutputFormat::Table => print_table(),
        OutputFormat::Json => print_json()?,
        OutputFormat::Plain => print_plain(),
    }

    Ok(())
}

fn print_table() {
    println!("{}", style(PORT_INTERFACE_SPEC.name).cyan().bold());
    println!();
    println!(
        "{:<18} {:<6} {:<6}",
        style("METHOD").bold(),
        style("IN").bold(),
        style("OUT").bold()
    );
    println!("{}", "-".repeat(30));

    for method in PORT_INTERFACE_SPEC.methods {
        println!("{:<18} {:<6} {:<6}", method.name, method.input, method.output);
    }
}

fn print_json() -> SerialBusResult<()> {
    let json = serde_json::to_string_pretty(&PORT_INTERFACE_SPEC)?;
    println!("{}", json);
    Ok(())
}

fn print_plain() {
    for method in PORT_INTERFACE_SPEC.methods {
        println!("{}", method.name);
    }
}
