//! Contacts and recent command implementations.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};

use deskbridge_core::contacts::{AddressBook, Contact};

use super::{ContactsAction, ContactsArgs, RecentArgs};

/// Run the contacts command.
pub fn run(args: ContactsArgs) -> Result<()> {
    let mut book = AddressBook::load().context("Failed to load address book")?;

    match args.action {
        ContactsAction::List { json } => {
            if json {
                return super::print_json(&serde_json::to_value(book.list())?);
            }
            print_contacts(&book, Utc::now());
            Ok(())
        }
        ContactsAction::Add {
            identifier,
            alias,
            group,
            favorite,
        } => {
            let mut contact = book
                .get(&identifier)
                .cloned()
                .unwrap_or_else(|| Contact::new(identifier.as_str()));
            if let Some(alias) = alias {
                contact = contact.with_alias(alias);
            }
            if let Some(group) = group {
                contact = contact.with_group(group);
            }
            if favorite {
                contact = contact.favorite(true);
            }
            book.upsert(contact);
            book.save()?;
            println!("Saved {identifier}");
            Ok(())
        }
        ContactsAction::Remove { identifier } => {
            if !book.remove(&identifier) {
                bail!("No contact with identifier {identifier}");
            }
            book.save()?;
            println!("Removed {identifier}");
            Ok(())
        }
        ContactsAction::Forget { identifier } => {
            if book.forget_credential(&identifier) {
                book.save()?;
                println!("Forgot the credential for {identifier}");
            } else {
                println!("No credential remembered for {identifier}");
            }
            Ok(())
        }
    }
}

/// Run the recent command.
pub fn run_recent(args: &RecentArgs) -> Result<()> {
    let book = AddressBook::load().context("Failed to load address book")?;

    if args.json {
        return super::print_json(&serde_json::json!({ "recent": book.recent() }));
    }

    if book.recent().is_empty() {
        println!("No recent connections.");
        return Ok(());
    }
    for identifier in book.recent() {
        match book.get(identifier) {
            Some(contact) if contact.alias.is_some() => {
                println!("  {identifier}  {}", contact.display_name());
            }
            _ => println!("  {identifier}"),
        }
    }
    Ok(())
}

fn print_contacts(book: &AddressBook, now: DateTime<Utc>) {
    let contacts = book.list();
    println!("Contacts:");
    println!("{}", "─".repeat(64));
    println!(
        "  {:1} {:10}  {:20}  {:12}  {:12}",
        "", "Id", "Alias", "Group", "Last seen"
    );
    println!("{}", "─".repeat(64));

    if contacts.is_empty() {
        println!("  (no contacts)");
    }
    for contact in contacts {
        println!(
            "  {:1} {:10}  {:20}  {:12}  {:12}",
            if contact.favorite { "*" } else { "" },
            contact.identifier,
            contact.alias.as_deref().unwrap_or("-"),
            contact.group.as_deref().unwrap_or("-"),
            contact
                .last_connected
                .map_or_else(|| "never".to_string(), |at| format_ago(now, at)),
        );
    }
    println!("{}", "─".repeat(64));
}

/// Coarse "time ago" label.
fn format_ago(now: DateTime<Utc>, then: DateTime<Utc>) -> String {
    let elapsed = now.signed_duration_since(then);
    if elapsed.num_minutes() < 1 {
        "just now".to_string()
    } else if elapsed.num_hours() < 1 {
        format!("{}m ago", elapsed.num_minutes())
    } else if elapsed.num_days() < 1 {
        format!("{}h ago", elapsed.num_hours())
    } else {
        format!("{}d ago", elapsed.num_days())
    }
}
