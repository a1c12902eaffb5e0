//! Status command - show ledger totals

use anyhow::Result;
use colored::Colorize;
use comfy_table::{ContentArrangement, Table};

use super::{get_context, GlobalArgs};
use crate::output;

pub fn run(global: &GlobalArgs, json: bool) -> Result<()> {
    let ctx = get_context()?;
    let result = ctx.status_service.get_status(&global.request());

    if json {
        return output::print_json(result);
    }
    let status = result?;

    println!("{}", "Ledger Status".bold());
    println!();

    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);

    table.add_row(vec!["Accounts", &status.total_accounts.to_string()]);
    table.add_row(vec!["Entries", &status.total_entries.to_string()]);
    table.add_row(vec!["Transfers", &status.total_transfers.to_string()]);

    println!("{}", table);
    println!();

    if !status.balances.is_empty() {
        println!("{}", "Balances".bold());
        for total in &status.balances {
            println!("  • {}", output::format_amount(total.total, total.currency));
        }
    }

    Ok(())
}
