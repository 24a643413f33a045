use serde_json::{json, Map, Value};

use deskrail_core::policy::ScoringPolicy;
use deskrail_core::{Analysis, Ticket, TicketType};

/// Priority with its full term-by-term breakdown.
#[derive(Debug, Clone)]
pub struct PriorityScore {
    pub base: f64,
    pub extra: f64,
    pub value: f64,
    pub breakdown: Map<String, Value>,
}

/// Pure priority function over a ticket and its (possibly partial) analysis.
///
/// `total_rows` is the batch size, needed for the FIFO bonus: earlier rows
/// earn linearly more, up to the configured maximum for row 0.
pub fn score_ticket(
    ticket: &Ticket,
    analysis: &Analysis,
    policy: &ScoringPolicy,
    total_rows: u32,
) -> PriorityScore {
    let age = ticket.effective_age();

    let segment_term = policy.weights.segment * policy.segment_value(ticket.segment);
    let type_term = policy.weights.ticket_type * policy.type_value(analysis.detected_type);
    let sentiment_term = policy.weights.sentiment * policy.sentiment_value(analysis.sentiment);
    let age_term = policy.weights.age * policy.age_value(age);
    let repeat_term = policy.weights.repeat * policy.repeat_value(ticket.repeat_count);

    let base = 10.0 * (segment_term + type_term + sentiment_term + age_term + repeat_term);

    let mut breakdown = Map::new();
    breakdown.insert("segment".into(), json!(segment_term * 10.0));
    breakdown.insert("type".into(), json!(type_term * 10.0));
    breakdown.insert("sentiment".into(), json!(sentiment_term * 10.0));
    breakdown.insert("age".into(), json!(age_term * 10.0));
    breakdown.insert("repeat".into(), json!(repeat_term * 10.0));
    breakdown.insert("base".into(), json!(base));

    // Additive extras, each bounded.
    let mut extra = 0.0;

    let fifo = fifo_bonus(ticket.row_index, total_rows, policy.fifo_bonus_max);
    if fifo > 0.0 {
        breakdown.insert("fifo".into(), json!(fifo));
        extra += fifo;
    }

    if let Some(country) = ticket.address.country.as_deref() {
        if policy.is_expansion_country(country) {
            breakdown.insert("expansion".into(), json!(policy.expansion_bonus));
            extra += policy.expansion_bonus;
        }
    }

    if ticket.segment == deskrail_core::Segment::Vip {
        if let Some(a) = age {
            if a < policy.young_vip_age_below {
                breakdown.insert("young_vip".into(), json!(policy.young_vip_bonus));
                extra += policy.young_vip_bonus;
            }
        }
    }

    let mut value = (base + extra).clamp(policy.floor, policy.ceiling);
    if analysis.detected_type == TicketType::Fraud && value < policy.fraud_floor {
        value = policy.fraud_floor;
        breakdown.insert("fraud_floor".into(), json!(policy.fraud_floor));
    }

    breakdown.insert("extra".into(), json!(extra));
    breakdown.insert("final".into(), json!(value));

    PriorityScore {
        base,
        extra,
        value,
        breakdown,
    }
}

/// Linear FIFO bonus: row 0 gets the full bonus, the last row gets none.
fn fifo_bonus(row_index: u32, total_rows: u32, max_bonus: f64) -> f64 {
    if total_rows <= 1 {
        return max_bonus;
    }
    let span = f64::from(total_rows - 1);
    let position = f64::from(row_index.min(total_rows - 1));
    max_bonus * (span - position) / span
}
