use crate::models::Payout;
use prettytable::{Cell, Row, Table};

fn build(headers: &[&str], rows: Vec<Vec<String>>) -> Table {
    let mut table = Table::new();
    table.set_titles(Row::new(headers.iter().map(|h| Cell::new(h)).collect()));
    for row in rows {
        table.add_row(Row::new(row.iter().map(|c| Cell::new(c)).collect()));
    }
    table
}

/// Print a titled grid of payout rows, original operator format.
pub fn print_payouts(title: &str, payouts: &[Payout]) {
    println!("@@ {} @@", title);
    if payouts.is_empty() {
        println!("-- Nothing to display --");
        println!();
        return;
    }
    let rows = payouts
        .iter()
        .map(|p| {
            vec![
                p.pid.clone(),
                p.user.clone(),
                p.address.clone(),
                s!(p.amount),
                s!(p.associated),
                s!(p.locked),
                p.txid_display().to_owned(),
            ]
        })
        .collect();
    build(
        &["pid", "user", "address", "amount", "associated", "locked", "txid"],
        rows,
    )
    .printstd();
    println!();
}

/// Generic titled grid for everything that is not a payout row.
pub fn print_grid(title: &str, headers: &[&str], rows: Vec<Vec<String>>) {
    println!("@@ {} @@", title);
    if rows.is_empty() {
        println!("-- Nothing to display --");
        println!();
        return;
    }
    build(headers, rows).printstd();
    println!();
}
