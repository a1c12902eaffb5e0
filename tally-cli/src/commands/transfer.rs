//! Transfer command - move funds between accounts

use anyhow::Result;

use super::{get_context, GlobalArgs};
use crate::output;
use tally_core::TransferRequest;

pub fn run(global: &GlobalArgs, from: i64, to: i64, amount: &str, json: bool) -> Result<()> {
    let amount = output::parse_amount(amount)?;
    let ctx = get_context()?;

    let result = ctx
        .transfer_service
        .transfer(&global.request(), TransferRequest::new(from, to, amount));

    if json {
        return output::print_json(result);
    }

    let result = result?;
    let currency = result.from_account.currency;
    output::success(&format!(
        "Transferred {} from account {} to account {}",
        output::format_amount(result.transfer.amount, currency),
        result.from_account.id,
        result.to_account.id
    ));
    println!("  Transfer ID: {}", result.transfer.id);
    println!(
        "  Account {} balance: {}",
        result.from_account.id,
        output::format_amount(result.from_account.balance, currency)
    );
    println!(
        "  Account {} balance: {}",
        result.to_account.id,
        output::format_amount(result.to_account.balance, currency)
    );
    Ok(())
}
