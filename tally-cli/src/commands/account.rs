//! Account commands - open, show, list and history

use anyhow::Result;
use clap::Subcommand;
use colored::Colorize;
use dialoguer::{Input, Select};
use tally_core::{Currency, NewAccount, Page};

use super::{get_context, GlobalArgs};
use crate::output;

#[derive(Subcommand)]
pub enum AccountCommands {
    /// Open a new account
    New {
        /// Account owner (defaults to --as)
        #[arg(long)]
        owner: Option<String>,
        /// Currency code (USD, EUR, CAD)
        #[arg(long)]
        currency: Option<Currency>,
        /// Opening balance in major units
        #[arg(long)]
        balance: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show one account
    Show {
        /// Account ID
        id: i64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List accounts
    List {
        /// Only accounts of this owner
        #[arg(long)]
        owner: Option<String>,
        #[arg(long, default_value_t = 0)]
        offset: u32,
        #[arg(long, default_value_t = 20)]
        limit: u32,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the entries or transfers of an account
    History {
        /// Account ID
        id: i64,
        /// List transfers instead of entries
        #[arg(long)]
        transfers: bool,
        #[arg(long, default_value_t = 0)]
        offset: u32,
        #[arg(long, default_value_t = 20)]
        limit: u32,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

pub fn run(global: &GlobalArgs, command: AccountCommands) -> Result<()> {
    match command {
        AccountCommands::New { owner, currency, balance, json } => {
            run_new(global, owner, currency, balance, json)
        }
        AccountCommands::Show { id, json } => run_show(global, id, json),
        AccountCommands::List { owner, offset, limit, json } => {
            run_list(global, owner, Page::new(offset, limit)?, json)
        }
        AccountCommands::History { id, transfers, offset, limit, json } => {
            run_history(global, id, transfers, Page::new(offset, limit)?, json)
        }
    }
}

fn run_new(
    global: &GlobalArgs,
    owner: Option<String>,
    currency: Option<Currency>,
    balance: Option<String>,
    json: bool,
) -> Result<()> {
    let ctx = get_context()?;
    let req = global.request();

    // Fall back to prompts for anything not given on the command line
    let owner = match owner.or_else(|| global.as_user.clone()) {
        Some(owner) => owner,
        None => Input::new().with_prompt("Owner").interact_text()?,
    };
    let currency = match currency {
        Some(currency) => currency,
        None => {
            let codes: Vec<&str> = Currency::ALL.iter().map(|c| c.code()).collect();
            let selected = Select::new()
                .with_prompt("Currency")
                .items(&codes)
                .default(0)
                .interact()?;
            Currency::ALL[selected]
        }
    };
    let balance = match balance {
        Some(balance) => output::parse_amount(&balance)?,
        None => {
            let raw: String = Input::new()
                .with_prompt("Opening balance")
                .default("0".to_string())
                .interact_text()?;
            output::parse_amount(&raw)?
        }
    };

    let result = ctx
        .account_service
        .create_account(&req, NewAccount::new(owner, currency, balance));

    if json {
        return output::print_json(result);
    }

    let account = result?;
    output::success(&format!("Account {} opened", account.id));
    println!("  Owner: {}", account.owner);
    println!("  Balance: {}", output::format_amount(account.balance, account.currency));
    Ok(())
}

fn run_show(global: &GlobalArgs, id: i64, json: bool) -> Result<()> {
    let ctx = get_context()?;
    let result = ctx.account_service.get_account(&global.request(), id);

    if json {
        return output::print_json(result);
    }

    let account = result?;
    let mut table = output::create_table();
    table.add_row(vec!["ID", &account.id.to_string()]);
    table.add_row(vec!["Owner", &account.owner]);
    table.add_row(vec!["Currency", account.currency.code()]);
    table.add_row(vec![
        "Balance",
        &output::format_amount(account.balance, account.currency),
    ]);
    table.add_row(vec!["Opened", &account.created_at.to_rfc3339()]);
    println!("{}", table);
    Ok(())
}

fn run_list(global: &GlobalArgs, owner: Option<String>, page: Page, json: bool) -> Result<()> {
    let ctx = get_context()?;
    let result = ctx
        .account_service
        .list_accounts(&global.request(), owner.as_deref(), page);

    if json {
        return output::print_json(result);
    }

    let accounts = result?;
    if accounts.is_empty() {
        println!("{}", "No accounts".dimmed());
        return Ok(());
    }

    let mut table = output::create_table();
    table.set_header(vec!["ID", "Owner", "Balance", "Opened"]);
    for account in &accounts {
        table.add_row(vec![
            account.id.to_string(),
            account.owner.clone(),
            output::format_amount(account.balance, account.currency),
            account.created_at.format("%Y-%m-%d").to_string(),
        ]);
    }
    println!("{}", table);
    Ok(())
}

fn run_history(global: &GlobalArgs, id: i64, transfers: bool, page: Page, json: bool) -> Result<()> {
    let ctx = get_context()?;
    let req = global.request();

    if transfers {
        let result = ctx.account_service.list_transfers(&req, id, page);
        if json {
            return output::print_json(result);
        }
        let transfers = result?;
        let currency = ctx.account_service.get_account(&req, id)?.currency;

        let mut table = output::create_table();
        table.set_header(vec!["Transfer", "From", "To", "Amount", "Time"]);
        for transfer in &transfers {
            table.add_row(vec![
                transfer.id.to_string(),
                transfer.from_account_id.to_string(),
                transfer.to_account_id.to_string(),
                output::format_amount(transfer.amount, currency),
                transfer.created_at.to_rfc3339(),
            ]);
        }
        println!("{}", table);
        return Ok(());
    }

    let result = ctx.account_service.list_entries(&req, id, page);
    if json {
        return output::print_json(result);
    }
    let entries = result?;
    let currency = ctx.account_service.get_account(&req, id)?.currency;

    let mut table = output::create_table();
    table.set_header(vec!["Entry", "Amount", "Time"]);
    for entry in &entries {
        let amount = output::format_amount(entry.amount, currency);
        table.add_row(vec![
            entry.id.to_string(),
            if entry.is_debit() {
                amount.red().to_string()
            } else {
                amount.green().to_string()
            },
            entry.created_at.to_rfc3339(),
        ]);
    }
    println!("{}", table);
    Ok(())
}
