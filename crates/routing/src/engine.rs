use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use deskrail_core::policy::{Relaxable, RoutingPolicy};
use deskrail_core::{Agent, Assignment, GeoPoint, Office, Segment, TicketId, TicketType};
use deskrail_geo::haversine_km;

use crate::ledger::LoadLedger;

/// What the engine needs to know about one ticket: identity, priority,
/// the analysis fields that derive skill requirements, and coordinates.
#[derive(Debug, Clone)]
pub struct RoutingTicket {
    pub ticket_id: TicketId,
    pub row_index: u32,
    pub segment: Segment,
    pub detected_type: TicketType,
    pub language: String,
    pub priority_final: f64,
    pub coordinates: Option<GeoPoint>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoutingFailure {
    /// Even the fully relaxed candidate set was empty.
    #[error("no-eligible-agents")]
    NoEligibleAgents,
}

/// Geo filter → skill filter with relaxation cascade → lowest-load selection.
pub struct RoutingEngine {
    policy: RoutingPolicy,
    ledger: Arc<LoadLedger>,
}

impl RoutingEngine {
    pub fn new(policy: RoutingPolicy, ledger: Arc<LoadLedger>) -> Self {
        Self { policy, ledger }
    }

    /// Route a whole batch.
    ///
    /// Tickets are processed in descending final priority (row index breaks
    /// ties) because every assignment commits load the next decision must
    /// see. Results come back in processing order.
    pub fn route_batch(
        &self,
        tickets: &[RoutingTicket],
        agents: &[Agent],
        offices: &[Office],
    ) -> Vec<(TicketId, Result<Assignment, RoutingFailure>)> {
        let mut ordered: Vec<&RoutingTicket> = tickets.iter().collect();
        ordered.sort_by(|a, b| {
            b.priority_final
                .total_cmp(&a.priority_final)
                .then_with(|| a.row_index.cmp(&b.row_index))
        });

        ordered
            .into_iter()
            .map(|t| (t.ticket_id, self.route_one(t, agents, offices)))
            .collect()
    }

    /// Route a single ticket against the current ledger state.
    pub fn route_one(
        &self,
        ticket: &RoutingTicket,
        agents: &[Agent],
        offices: &[Office],
    ) -> Result<Assignment, RoutingFailure> {
        let active: Vec<&Agent> = agents.iter().filter(|a| a.active).collect();

        // 1. Geo filter. Coordinate-less tickets skip it entirely.
        let mut office_distance: HashMap<&str, f64> = HashMap::new();
        let mut radius_km: Option<f64> = None;
        let geo_pool: Vec<&Agent> = match ticket.coordinates {
            Some(point) => {
                for office in offices {
                    office_distance
                        .insert(office.id.as_str(), haversine_km(point, office.location));
                }
                let nearest = office_distance
                    .values()
                    .copied()
                    .fold(f64::INFINITY, f64::min);
                if nearest.is_finite() {
                    let radius =
                        (nearest * self.policy.radius_slack).max(self.policy.min_radius_km);
                    radius_km = Some(radius);
                    active
                        .iter()
                        .copied()
                        .filter(|a| {
                            office_distance
                                .get(a.office_id.as_str())
                                .is_some_and(|d| *d <= radius)
                        })
                        .collect()
                } else {
                    // no offices on file, nothing to filter against
                    active.clone()
                }
            }
            None => active.clone(),
        };

        if geo_pool.is_empty() {
            warn!(ticket = %ticket.ticket_id, "no agents inside geo radius");
            return Err(RoutingFailure::NoEligibleAgents);
        }

        // 2. Skill filter with relaxation cascade.
        let language = ticket.language.to_uppercase();
        let mut requirements: Vec<Relaxable> = Vec::new();
        if matches!(ticket.segment, Segment::Vip | Segment::Priority) {
            requirements.push(Relaxable::Vip);
        }
        if ticket.detected_type == TicketType::DataChange {
            requirements.push(Relaxable::Position);
        }
        if self.policy.language_needs_skill(&language) {
            requirements.push(Relaxable::Language);
        }

        let mut relaxed: Vec<Relaxable> = Vec::new();
        let mut candidates = filter_by_requirements(&geo_pool, &requirements, &language);
        if candidates.is_empty() {
            for step in &self.policy.relaxation_order {
                let Some(pos) = requirements.iter().position(|r| r == step) else {
                    continue;
                };
                requirements.remove(pos);
                relaxed.push(*step);
                debug!(ticket = %ticket.ticket_id, dropped = %step, "relaxing requirement");
                candidates = filter_by_requirements(&geo_pool, &requirements, &language);
                if !candidates.is_empty() {
                    break;
                }
            }
        }

        if candidates.is_empty() {
            warn!(ticket = %ticket.ticket_id, "candidate set empty after full relaxation");
            return Err(RoutingFailure::NoEligibleAgents);
        }

        // 3. Selection: lowest committed load, ties to higher skill factor,
        // then lexicographic agent id.
        let snapshot = self.ledger.snapshot();
        let chosen = candidates
            .iter()
            .min_by(|a, b| {
                let load_a = snapshot.get(a.id.as_str()).copied().unwrap_or(0);
                let load_b = snapshot.get(b.id.as_str()).copied().unwrap_or(0);
                load_a
                    .cmp(&load_b)
                    .then_with(|| b.skill_factor.total_cmp(&a.skill_factor))
                    .then_with(|| a.id.cmp(&b.id))
            })
            .expect("candidates is non-empty");

        let load_before = snapshot.get(chosen.id.as_str()).copied().unwrap_or(0);
        let difficulty = self.policy.difficulty_for(ticket.detected_type);
        let load_after = self.ledger.commit(&chosen.id, difficulty);

        let distance = office_distance.get(chosen.office_id.as_str()).copied();
        let assignment = build_assignment(
            ticket,
            chosen,
            distance,
            radius_km,
            &requirements,
            &relaxed,
            load_before,
            load_after,
            difficulty,
        );

        info!(
            ticket = %ticket.ticket_id,
            agent = %chosen.id,
            office = %chosen.office_id,
            load_after,
            "ticket assigned"
        );
        Ok(assignment)
    }
}

fn filter_by_requirements<'a>(
    pool: &[&'a Agent],
    requirements: &[Relaxable],
    language: &str,
) -> Vec<&'a Agent> {
    pool.iter()
        .copied()
        .filter(|agent| {
            requirements.iter().all(|req| match req {
                Relaxable::Vip => agent.has_skill("VIP"),
                Relaxable::Position => agent.position == deskrail_core::Position::Chief,
                Relaxable::Language => agent.has_skill(language),
            })
        })
        .collect()
}

#[allow(clippy::too_many_arguments)]
fn build_assignment(
    ticket: &RoutingTicket,
    agent: &Agent,
    distance_km: Option<f64>,
    radius_km: Option<f64>,
    enforced: &[Relaxable],
    relaxed: &[Relaxable],
    load_before: u32,
    load_after: u32,
    difficulty: u32,
) -> Assignment {
    let enforced_labels: Vec<String> = enforced.iter().map(|r| r.to_string()).collect();
    let relaxed_labels: Vec<String> = relaxed.iter().map(|r| r.to_string()).collect();

    let distance_part = match distance_km {
        Some(d) => format!("office {} at {:.1} km", agent.office_id, d),
        None => format!("office {} (no ticket coordinates)", agent.office_id),
    };
    let enforced_part = if enforced_labels.is_empty() {
        "none".to_string()
    } else {
        enforced_labels.join(", ")
    };
    let relaxed_part = if relaxed_labels.is_empty() {
        "none".to_string()
    } else {
        relaxed_labels.join(", ")
    };
    let explanation = format!(
        "agent {} ({}); constraints enforced: {}; relaxed: {}; load {} -> {}",
        agent.id, distance_part, enforced_part, relaxed_part, load_before, load_after
    );

    let mut details = Map::new();
    details.insert("relaxation".into(), json!(relaxed_labels));
    details.insert("enforced".into(), json!(enforced_labels));
    details.insert(
        "distance_km".into(),
        distance_km.map_or(Value::Null, |d| json!(d)),
    );
    details.insert(
        "radius_km".into(),
        radius_km.map_or(Value::Null, |r| json!(r)),
    );
    details.insert("load_before".into(), json!(load_before));
    details.insert("load_after".into(), json!(load_after));
    details.insert("difficulty".into(), json!(difficulty));
    details.insert("priority".into(), json!(ticket.priority_final));

    Assignment {
        ticket_id: ticket.ticket_id,
        agent_id: agent.id.clone(),
        office_id: agent.office_id.clone(),
        explanation,
        details,
        assigned_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deskrail_core::Position;
    use uuid::Uuid;

    fn agent(id: &str, office: &str, skills: &[&str], position: Position) -> Agent {
        Agent {
            id: id.to_string(),
            full_name: format!("Agent {id}"),
            position,
            skills: skills.iter().map(|s| s.to_string()).collect(),
            skill_factor: 1.0,
            office_id: office.to_string(),
            stress: 0.1,
            active: true,
        }
    }

    fn office(id: &str, lat: f64, lon: f64) -> Office {
        Office {
            id: id.to_string(),
            name: format!("Office {id}"),
            address: String::new(),
            location: GeoPoint { lat, lon },
        }
    }

    fn ticket(segment: Segment, detected_type: TicketType, language: &str) -> RoutingTicket {
        RoutingTicket {
            ticket_id: Uuid::new_v4(),
            row_index: 0,
            segment,
            detected_type,
            language: language.to_string(),
            priority_final: 5.0,
            coordinates: None,
        }
    }

    fn engine() -> RoutingEngine {
        RoutingEngine::new(RoutingPolicy::default(), Arc::new(LoadLedger::new()))
    }

    // Roughly 1° of latitude = 111 km.
    const BASE: GeoPoint = GeoPoint { lat: 50.0, lon: 70.0 };

    #[test]
    fn load_balancing_spreads_evenly() {
        let engine = RoutingEngine::new(RoutingPolicy::default(), Arc::new(LoadLedger::new()));
        let agents = vec![
            agent("a-1", "o-1", &[], Position::Specialist),
            agent("a-2", "o-1", &[], Position::Specialist),
            agent("a-3", "o-1", &[], Position::Specialist),
        ];
        let offices = vec![office("o-1", BASE.lat, BASE.lon)];

        let tickets: Vec<RoutingTicket> = (0..10)
            .map(|i| {
                let mut t = ticket(Segment::Mass, TicketType::Consultation, "RU");
                t.row_index = i;
                t
            })
            .collect();

        let results = engine.route_batch(&tickets, &agents, &offices);
        assert!(results.iter().all(|(_, r)| r.is_ok()));

        let mut per_agent: HashMap<String, u32> = HashMap::new();
        for (_, result) in &results {
            *per_agent
                .entry(result.as_ref().unwrap().agent_id.clone())
                .or_insert(0) += 1;
        }
        let loads: Vec<u32> = per_agent.values().copied().collect();
        assert_eq!(loads.iter().sum::<u32>(), 10);
        let max = loads.iter().max().unwrap();
        let min = loads.iter().min().unwrap();
        assert!(max - min <= 1, "unbalanced loads: {per_agent:?}");
    }

    #[test]
    fn geo_filter_uses_nearest_times_slack() {
        let engine = engine();
        // Nearest office ~111 km away, far office ~333 km. Radius becomes
        // max(111 * 1.5, 50) ≈ 166 km, so only the near office qualifies.
        let agents = vec![
            agent("near", "o-near", &[], Position::Specialist),
            agent("far", "o-far", &[], Position::Specialist),
        ];
        let offices = vec![
            office("o-near", BASE.lat + 1.0, BASE.lon),
            office("o-far", BASE.lat + 3.0, BASE.lon),
        ];
        let mut t = ticket(Segment::Mass, TicketType::Consultation, "RU");
        t.coordinates = Some(BASE);

        let assignment = engine.route_one(&t, &agents, &offices).unwrap();
        assert_eq!(assignment.agent_id, "near");
    }

    #[test]
    fn minimum_radius_keeps_close_offices_eligible() {
        let engine = engine();
        // Nearest ~11 km, second ~33 km. 11 * 1.5 < 50, so the 50 km floor
        // keeps both offices in range; lowest load then picks either, and
        // the id tie-break makes it deterministic.
        let agents = vec![
            agent("a-far", "o-2", &[], Position::Specialist),
            agent("a-near", "o-1", &[], Position::Specialist),
        ];
        let offices = vec![
            office("o-1", BASE.lat + 0.1, BASE.lon),
            office("o-2", BASE.lat + 0.3, BASE.lon),
        ];
        let mut t = ticket(Segment::Mass, TicketType::Consultation, "RU");
        t.coordinates = Some(BASE);

        let assignment = engine.route_one(&t, &agents, &offices).unwrap();
        assert_eq!(assignment.agent_id, "a-far");
    }

    #[test]
    fn vip_requirement_relaxes_when_no_vip_agent_reachable() {
        let engine = engine();
        // Only office in range has no VIP-tagged agents.
        let agents = vec![
            agent("plain-1", "o-1", &[], Position::Specialist),
            agent("vip-far", "o-far", &["VIP"], Position::Specialist),
        ];
        let offices = vec![
            office("o-1", BASE.lat + 1.0, BASE.lon),
            office("o-far", BASE.lat + 5.0, BASE.lon),
        ];
        let mut t = ticket(Segment::Vip, TicketType::Complaint, "RU");
        t.coordinates = Some(BASE);

        let assignment = engine.route_one(&t, &agents, &offices).unwrap();
        assert_eq!(assignment.agent_id, "plain-1");
        assert_eq!(assignment.details["relaxation"], json!(["VIP"]));
        assert!(assignment.explanation.contains("relaxed: VIP"));
    }

    #[test]
    fn language_relaxes_before_vip() {
        let engine = engine();
        // VIP-skilled agent exists but nobody speaks KZ: language must be
        // dropped first and VIP stays enforced.
        let agents = vec![
            agent("vip-ru", "o-1", &["VIP"], Position::Specialist),
            agent("plain-kz", "o-1", &["KZ"], Position::Specialist),
        ];
        let offices = vec![office("o-1", BASE.lat, BASE.lon)];
        let t = ticket(Segment::Priority, TicketType::Complaint, "KZ");

        let assignment = engine.route_one(&t, &agents, &offices).unwrap();
        assert_eq!(assignment.agent_id, "vip-ru");
        assert_eq!(assignment.details["relaxation"], json!(["language"]));
        assert_eq!(assignment.details["enforced"], json!(["VIP"]));
        assert!(assignment.explanation.contains("relaxed: language"));
    }

    #[test]
    fn data_change_requires_chief() {
        let engine = engine();
        let agents = vec![
            agent("spec", "o-1", &[], Position::Specialist),
            agent("chief", "o-1", &[], Position::Chief),
        ];
        let offices = vec![office("o-1", BASE.lat, BASE.lon)];
        let t = ticket(Segment::Mass, TicketType::DataChange, "RU");

        let assignment = engine.route_one(&t, &agents, &offices).unwrap();
        assert_eq!(assignment.agent_id, "chief");
        assert_eq!(assignment.details["relaxation"], json!([] as [String; 0]));
    }

    #[test]
    fn empty_geo_pool_fails_without_relaxation_help() {
        let engine = engine();
        // The nearest office has no agents; the staffed office sits outside
        // max(nearest * 1.5, 50 km).
        let agents = vec![agent("a-1", "o-far", &[], Position::Specialist)];
        let offices = vec![
            office("o-empty", BASE.lat + 0.2, BASE.lon),
            office("o-far", BASE.lat + 4.0, BASE.lon),
        ];
        let mut t = ticket(Segment::Mass, TicketType::Consultation, "RU");
        t.coordinates = Some(BASE);

        assert_eq!(
            engine.route_one(&t, &agents, &offices),
            Err(RoutingFailure::NoEligibleAgents)
        );
    }

    #[test]
    fn selection_tie_breaks_on_skill_factor_then_id() {
        let engine = engine();
        let mut strong = agent("z-strong", "o-1", &[], Position::Specialist);
        strong.skill_factor = 2.0;
        let weak = agent("a-weak", "o-1", &[], Position::Specialist);
        let offices = vec![office("o-1", BASE.lat, BASE.lon)];
        let t = ticket(Segment::Mass, TicketType::Consultation, "RU");

        // equal loads: higher skill factor wins despite later id
        let assignment = engine
            .route_one(&t, &[weak.clone(), strong.clone()], &offices)
            .unwrap();
        assert_eq!(assignment.agent_id, "z-strong");

        // equal loads and factors: lexicographic id
        let mut peer = strong.clone();
        peer.id = "b-peer".into();
        let assignment = engine
            .route_one(&t, &[strong.clone(), peer], &offices)
            .unwrap();
        assert_eq!(assignment.agent_id, "b-peer");
    }

    #[test]
    fn difficulty_weight_drives_committed_load() {
        let ledger = Arc::new(LoadLedger::new());
        let mut policy = RoutingPolicy::default();
        policy.difficulty_weights.insert(TicketType::Fraud, 3);
        let engine = RoutingEngine::new(policy, ledger.clone());

        let agents = vec![agent("a-1", "o-1", &[], Position::Specialist)];
        let offices = vec![office("o-1", BASE.lat, BASE.lon)];
        let t = ticket(Segment::Mass, TicketType::Fraud, "RU");

        let assignment = engine.route_one(&t, &agents, &offices).unwrap();
        assert_eq!(ledger.load_of("a-1"), 3);
        assert_eq!(assignment.details["difficulty"], json!(3));
        assert_eq!(assignment.details["load_after"], json!(3));
    }

    #[test]
    fn batch_processes_highest_priority_first() {
        let engine = engine();
        let agents = vec![agent("a-1", "o-1", &[], Position::Specialist)];
        let offices = vec![office("o-1", BASE.lat, BASE.lon)];

        let mut low = ticket(Segment::Mass, TicketType::Consultation, "RU");
        low.row_index = 0;
        low.priority_final = 2.0;
        let mut high = ticket(Segment::Mass, TicketType::Consultation, "RU");
        high.row_index = 1;
        high.priority_final = 9.0;

        let results = engine.route_batch(&[low.clone(), high.clone()], &agents, &offices);
        assert_eq!(results[0].0, high.ticket_id);
        assert_eq!(results[1].0, low.ticket_id);
        // the high-priority ticket saw the empty ledger
        let first = results[0].1.as_ref().unwrap();
        assert_eq!(first.details["load_before"], json!(0));
    }

    #[test]
    fn inactive_agents_never_receive_work() {
        let engine = engine();
        let mut off_duty = agent("a-1", "o-1", &[], Position::Specialist);
        off_duty.active = false;
        let offices = vec![office("o-1", BASE.lat, BASE.lon)];
        let t = ticket(Segment::Mass, TicketType::Consultation, "RU");

        assert_eq!(
            engine.route_one(&t, &[off_duty], &offices),
            Err(RoutingFailure::NoEligibleAgents)
        );
    }
}
