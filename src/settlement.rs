//! Ticket settlement against the official result and payout table.
//!
//! `settle` is total: malformed tickets miss, and hits without payout data
//! return 0 with `payout_missing` set so the gap shows up in reports.

use std::collections::BTreeSet;

use crate::types::{BetTicket, BetType, HorseNumber, Outcome, Race, SettledTicket};

/// Resolve one ticket.
pub fn settle(ticket: &BetTicket, race: &Race) -> SettledTicket {
    let hit = is_hit(ticket, race);
    if !hit {
        return SettledTicket {
            ticket: ticket.clone(),
            outcome: Outcome::Miss,
            payout: 0,
            payout_missing: false,
        };
    }

    let multiplier = match ticket.bet_type {
        BetType::Win => ticket
            .horses
            .first()
            .and_then(|h| race.entrant(*h))
            .and_then(|e| e.win_odds),
        other => race.payouts.lookup(other, &ticket.horses),
    };

    match multiplier {
        Some(m) if m.is_finite() && m > 0.0 => SettledTicket {
            ticket: ticket.clone(),
            outcome: Outcome::Hit,
            payout: to_yen(m, ticket.stake),
            payout_missing: false,
        },
        _ => {
            tracing::warn!(
                "{}: {} {} hit but payout data is missing",
                race.key,
                ticket.bet_type,
                ticket.combination()
            );
            SettledTicket {
                ticket: ticket.clone(),
                outcome: Outcome::Hit,
                payout: 0,
                payout_missing: true,
            }
        }
    }
}

/// Settle every ticket of a race.
pub fn settle_all(tickets: &[BetTicket], race: &Race) -> Vec<SettledTicket> {
    tickets.iter().map(|t| settle(t, race)).collect()
}

/// Payouts are whole yen.
fn to_yen(multiplier: f64, stake: u64) -> u64 {
    (multiplier * stake as f64).round() as u64
}

fn is_hit(ticket: &BetTicket, race: &Race) -> bool {
    let horses = &ticket.horses;
    if horses.len() != ticket.bet_type.legs() || has_duplicates(horses) {
        return false;
    }
    let Some(positions) = finish_positions(race, horses) else {
        return false;
    };

    match ticket.bet_type {
        BetType::Win => positions[0] == 1,
        BetType::Place => positions[0] <= 3,
        // Any 2 of the top 3.
        BetType::Wide => fits_top(&positions, 1),
        BetType::Quinella | BetType::TrifectaBox => fits_top(&positions, 0),
        BetType::Exacta => positions[0] == 1 && positions[1] <= 2,
    }
}

/// Finish positions in ticket order; `None` if a horse is missing or did not finish.
fn finish_positions(race: &Race, horses: &[HorseNumber]) -> Option<Vec<u32>> {
    horses
        .iter()
        .map(|h| race.entrant(*h)?.finish_position.filter(|p| *p >= 1))
        .collect()
}

/// Whether the horses fill the first places, allowing `slack` places of room.
///
/// The k-th best of the ticket's positions must be at most k + slack. A
/// position counts the horses ahead, so dead heats are handled: with a dead
/// heat for 2nd (1, 2, 2) both winner-second pairs fit, the two seconds do not.
fn fits_top(positions: &[u32], slack: u32) -> bool {
    let mut sorted = positions.to_vec();
    sorted.sort_unstable();
    sorted
        .iter()
        .enumerate()
        .all(|(k, &p)| p <= k as u32 + 1 + slack)
}

fn has_duplicates(horses: &[HorseNumber]) -> bool {
    horses.iter().collect::<BTreeSet<_>>().len() != horses.len()
}
