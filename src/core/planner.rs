//! KN-005: Plan generation — diff a module declaration against the journal.
//!
//! Planning is read-only. Any mismatch between what the journal recorded and
//! what the module now declares is a journal conflict, raised here so a run
//! aborts before its first side effect.

use super::error::{KilnError, Result};
use super::journal::Journal;
use super::types::*;

/// Generate a deployment plan for a resolved module.
pub fn plan(module: &Module, order: &ExecutionPlan, journal: &Journal) -> Result<DeploymentPlan> {
    let mut steps = Vec::with_capacity(order.order.len());
    let mut to_create = 0u32;
    let mut to_retry = 0u32;
    let mut to_recover = 0u32;
    let mut reused = 0u32;

    for id in &order.order {
        let Some(descriptor) = module.descriptor(id) else {
            continue;
        };
        let entry = journal.lookup(&module.name, id)?;
        let action = determine_action(&module.name, descriptor, entry.as_ref())?;

        match action {
            PlanAction::Reuse { .. } => reused += 1,
            PlanAction::Create => to_create += 1,
            PlanAction::Retry => to_retry += 1,
            PlanAction::Recover => to_recover += 1,
        }

        steps.push(PlannedStep {
            descriptor: id.clone(),
            kind: descriptor.kind.clone(),
            description: describe_action(descriptor, &action),
            action,
        });
    }

    check_orphans(module, journal)?;

    Ok(DeploymentPlan {
        module: module.name.clone(),
        steps,
        to_create,
        to_retry,
        to_recover,
        reused,
    })
}

/// Decide what to do with one descriptor given its journal entry.
fn determine_action(
    module: &str,
    descriptor: &Descriptor,
    entry: Option<&JournalEntry>,
) -> Result<PlanAction> {
    let Some(entry) = entry else {
        return Ok(PlanAction::Create);
    };

    let key = entry_key(module, &descriptor.id);
    if entry.kind != descriptor.kind {
        return Err(KilnError::JournalConflict {
            key,
            detail: format!(
                "journal recorded kind {} but module declares {}",
                entry.kind, descriptor.kind
            ),
        });
    }
    if entry.fingerprint != descriptor.fingerprint() {
        return Err(KilnError::JournalConflict {
            key,
            detail: "constructor arguments changed since the recorded execution".to_string(),
        });
    }

    Ok(match entry.status {
        EntryStatus::Completed => match &entry.result {
            Some(result) => PlanAction::Reuse {
                result: result.clone(),
            },
            None => {
                return Err(KilnError::JournalConflict {
                    key,
                    detail: "completed entry has no recorded result".to_string(),
                })
            }
        },
        EntryStatus::Failed => PlanAction::Retry,
        EntryStatus::Pending => PlanAction::Recover,
    })
}

/// Journal entries for descriptors the module no longer declares.
fn check_orphans(module: &Module, journal: &Journal) -> Result<()> {
    for entry in journal.entries(Some(&module.name))? {
        if module.descriptor(&entry.descriptor).is_none() {
            let hint = if entry.status == EntryStatus::Completed {
                "was deployed but is no longer declared"
            } else {
                "is no longer declared; wipe it to continue"
            };
            return Err(KilnError::JournalConflict {
                key: entry.key(),
                detail: hint.to_string(),
            });
        }
    }
    Ok(())
}

/// Human-readable description of a planned action.
fn describe_action(descriptor: &Descriptor, action: &PlanAction) -> String {
    match action {
        PlanAction::Create => format!(
            "{}: deploy {}({})",
            descriptor.id,
            descriptor.kind,
            describe_args(&descriptor.args)
        ),
        PlanAction::Retry => format!("{}: retry {} (previous attempt failed)", descriptor.id, descriptor.kind),
        PlanAction::Recover => format!(
            "{}: recover {} (previous run interrupted)",
            descriptor.id, descriptor.kind
        ),
        PlanAction::Reuse { result } => format!("{}: reuse {}", descriptor.id, result),
    }
}

fn describe_args(args: &[ArgValue]) -> String {
    args.iter()
        .map(|a| match a {
            ArgValue::Future(r) => format!("<{}>", r.future),
            ArgValue::Literal(serde_json::Value::String(s)) => format!("\"{}\"", s),
            ArgValue::Literal(v) => v.to_string(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::registry::build_module;
    use crate::core::resolver::build_execution_order;
    use indexmap::IndexMap;

    fn token_vault() -> Module {
        build_module("M", |m| {
            let token = m.define("token", "Token", vec!["X".into()])?;
            let vault = m.define("vault", "Vault", vec![token.as_arg(), ArgValue::literal(3)])?;
            Ok(IndexMap::from([
                ("token".to_string(), token),
                ("vault".to_string(), vault),
            ]))
        })
        .unwrap()
    }

    fn plan_for(module: &Module, journal: &Journal) -> Result<DeploymentPlan> {
        let order = build_execution_order(module).unwrap();
        plan(module, &order, journal)
    }

    #[test]
    fn test_kn005_plan_all_create() {
        let module = token_vault();
        let journal = Journal::in_memory().unwrap();
        let p = plan_for(&module, &journal).unwrap();
        assert_eq!(p.to_create, 2);
        assert_eq!(p.reused, 0);
        assert!(p.steps.iter().all(|s| s.action == PlanAction::Create));
        assert_eq!(p.steps[1].description, "vault: deploy Vault(<token>, 3)");
        assert_eq!(p.steps[0].description, "token: deploy Token(\"X\")");
    }

    #[test]
    fn test_kn005_plan_mixed_states() {
        let module = token_vault();
        let journal = Journal::in_memory().unwrap();
        journal.mark_pending("M", &module.descriptors["token"]).unwrap();
        journal.mark_completed("M", "token", "0xaa").unwrap();
        journal.mark_pending("M", &module.descriptors["vault"]).unwrap();
        journal.mark_failed("M", "vault", "reverted").unwrap();

        let p = plan_for(&module, &journal).unwrap();
        assert_eq!(p.reused, 1);
        assert_eq!(p.to_retry, 1);
        assert_eq!(
            p.steps[0].action,
            PlanAction::Reuse {
                result: "0xaa".to_string()
            }
        );
        assert_eq!(p.steps[1].action, PlanAction::Retry);
    }

    #[test]
    fn test_kn005_plan_recovers_pending() {
        let module = token_vault();
        let journal = Journal::in_memory().unwrap();
        journal.mark_pending("M", &module.descriptors["token"]).unwrap();
        let p = plan_for(&module, &journal).unwrap();
        assert_eq!(p.to_recover, 1);
        assert_eq!(p.to_create, 1);
    }

    #[test]
    fn test_kn005_changed_args_conflict() {
        let module = token_vault();
        let journal = Journal::in_memory().unwrap();
        journal.mark_pending("M", &module.descriptors["token"]).unwrap();
        journal.mark_completed("M", "token", "0xaa").unwrap();

        let changed = build_module("M", |m| {
            let token = m.define("token", "Token", vec!["Z".into()])?;
            m.define("vault", "Vault", vec![token.as_arg(), ArgValue::literal(3)])?;
            Ok(IndexMap::new())
        })
        .unwrap();
        let err = plan_for(&changed, &journal).unwrap_err();
        assert!(matches!(err, KilnError::JournalConflict { ref key, .. } if key == "M#token"));
    }

    #[test]
    fn test_kn005_changed_kind_conflict() {
        let module = token_vault();
        let journal = Journal::in_memory().unwrap();
        journal.mark_pending("M", &module.descriptors["token"]).unwrap();

        let mut renamed = module.clone();
        renamed.descriptors.get_mut("token").unwrap().kind = "TokenV2".to_string();
        let err = plan_for(&renamed, &journal).unwrap_err();
        assert!(err.to_string().contains("TokenV2"));
    }

    #[test]
    fn test_kn005_orphaned_entry_conflict() {
        let module = token_vault();
        let journal = Journal::in_memory().unwrap();
        journal.mark_pending("M", &module.descriptors["vault"]).unwrap();
        journal.mark_failed("M", "vault", "reverted").unwrap();

        let shrunk = build_module("M", |m| {
            m.define("token", "Token", vec!["X".into()])?;
            Ok(IndexMap::new())
        })
        .unwrap();
        let err = plan_for(&shrunk, &journal).unwrap_err();
        assert!(err.to_string().contains("wipe"));

        journal.wipe("M", "vault").unwrap();
        assert!(plan_for(&shrunk, &journal).is_ok());
    }

    #[test]
    fn test_kn005_other_modules_ignored() {
        let module = token_vault();
        let journal = Journal::in_memory().unwrap();
        journal.mark_pending("Other", &module.descriptors["vault"]).unwrap();
        let p = plan_for(&module, &journal).unwrap();
        assert_eq!(p.to_create, 2);
    }
}
