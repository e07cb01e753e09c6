use std::collections::BTreeMap;

use crate::{Block, BlockId, BlockKind, CodeUnit, Const, HostId, Op, Pc, Program, Slot, UnitId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyError {
    pub message: String,
}

impl std::fmt::Display for VerifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "verify error: {}", self.message)
    }
}

impl std::error::Error for VerifyError {}

fn err(message: String) -> Result<(), VerifyError> {
    Err(VerifyError { message })
}

pub fn verify_program(program: &Program) -> Result<(), VerifyError> {
    // Entry validity.
    if (program.entry.0 as usize) >= program.units.len() {
        return err(format!(
            "entry unit id {} out of range (units={})",
            program.entry.0,
            program.units.len()
        ));
    }

    // Recompute name -> id maps and ensure they match the stored ones.
    let mut expected_unit_ids = BTreeMap::new();
    for (idx, unit) in program.units.iter().enumerate() {
        if expected_unit_ids
            .insert(unit.name.clone(), UnitId(idx as u32))
            .is_some()
        {
            return err(format!("duplicate unit name `{}`", unit.name));
        }
    }
    if expected_unit_ids != program.unit_ids {
        return err("unit_ids map does not match units table".to_string());
    }

    let mut expected_host_ids = BTreeMap::new();
    for (idx, name) in program.hosts.iter().enumerate() {
        if expected_host_ids
            .insert(name.clone(), HostId(idx as u32))
            .is_some()
        {
            return err(format!("duplicate host import name `{name}`"));
        }
    }
    if expected_host_ids != program.host_ids {
        return err("host_ids map does not match hosts table".to_string());
    }

    let mut expected_slot_ids = BTreeMap::new();
    for (idx, name) in program.slots.iter().enumerate() {
        if expected_slot_ids
            .insert(name.clone(), Slot(idx as u32))
            .is_some()
        {
            return err(format!("duplicate slot name `{name}`"));
        }
    }
    if expected_slot_ids != program.slot_ids {
        return err("slot_ids map does not match slots table".to_string());
    }

    for unit in &program.units {
        verify_unit(program, unit)?;
    }
    Ok(())
}

fn verify_unit(program: &Program, unit: &CodeUnit) -> Result<(), VerifyError> {
    let len = unit.code.len() as Pc;
    verify_blocks(unit, len)?;

    for (pc, op) in unit.code.iter().enumerate() {
        let pc = pc as Pc;
        let ctx = |message: String| VerifyError {
            message: format!("unit `{}` pc {pc}: {message}", unit.name),
        };

        // A jump target may be one past the end: falling off the end of the
        // entry unit is the normal way a program finishes.
        let target = |t: Pc, what: &str| {
            if t > len {
                Err(ctx(format!("{what} {t} out of range (len={len})")))
            } else {
                Ok(())
            }
        };
        let slot = |s: Slot, what: &str| {
            if (s.0 as usize) >= program.slots.len() {
                Err(ctx(format!("{what} slot {} out of range", s.0)))
            } else {
                Ok(())
            }
        };
        let unit_ref = |u: UnitId, what: &str| {
            if (u.0 as usize) >= program.units.len() {
                Err(ctx(format!("{what} unit id {} out of range", u.0)))
            } else {
                Ok(())
            }
        };

        match op {
            Op::Const {
                value: Const::Code(u),
            } => unit_ref(*u, "code constant")?,
            Op::Load { slot: s } | Op::Store { slot: s } | Op::LocalScalar { slot: s } => {
                slot(*s, "variable")?
            }
            Op::Jump { target_pc } => target(*target_pc, "jump target")?,
            Op::JumpIfFalse { target_pc } => target(*target_pc, "branch target")?,
            Op::EnterBlock { block } => {
                block_at(unit, *block, pc, BlockKind::Bare).map_err(&ctx)?;
            }
            Op::LightCall { unit: u } | Op::EnterFormat { unit: u } => unit_ref(*u, "callee")?,
            Op::CallHost { host } => {
                if (host.0 as usize) >= program.hosts.len() {
                    return Err(ctx(format!("host import id {} out of range", host.0)));
                }
            }
            Op::EnterLoop {
                block,
                body_pc,
                next_pc,
                exit_pc,
                ..
            } => {
                block_at(unit, *block, pc, BlockKind::Loop).map_err(&ctx)?;
                target(*body_pc, "loop body")?;
                target(*next_pc, "loop re-entry")?;
                target(*exit_pc, "loop exit")?;
            }
            Op::EnterIter {
                var,
                block,
                body_pc,
                next_pc,
                exit_pc,
                ..
            } => {
                slot(*var, "loop variable")?;
                block_at(unit, *block, pc, BlockKind::Loop).map_err(&ctx)?;
                target(*body_pc, "loop body")?;
                target(*next_pc, "loop re-entry")?;
                target(*exit_pc, "loop exit")?;
            }
            Op::EnterTry { resume_pc, .. } => target(*resume_pc, "try resume")?,
            Op::EvalText { resume_pc } => target(*resume_pc, "eval resume")?,
            Op::SubstIter { body_pc } => target(*body_pc, "substitution body")?,
            Op::GrepStart {
                topic,
                body_pc,
                done_pc,
                ..
            }
            | Op::MapStart {
                topic,
                body_pc,
                done_pc,
                ..
            } => {
                slot(*topic, "topic")?;
                target(*body_pc, "combinator body")?;
                target(*done_pc, "combinator done")?;
            }
            Op::GrepWhile { body_pc } | Op::MapWhile { body_pc } => {
                target(*body_pc, "combinator body")?
            }
            _ => {}
        }
    }
    Ok(())
}

fn block_at(
    unit: &CodeUnit,
    id: BlockId,
    pc: Pc,
    kind: BlockKind,
) -> Result<&Block, String> {
    let Some(block) = unit.block(id) else {
        return Err(format!("block id {} out of range", id.0));
    };
    if block.kind != kind {
        return Err(format!("block {} has wrong kind {:?}", id.0, block.kind));
    }
    if block.start_pc != pc {
        return Err(format!(
            "block {} starts at {} but its entry op is at {pc}",
            id.0, block.start_pc
        ));
    }
    Ok(block)
}

fn verify_blocks(unit: &CodeUnit, len: Pc) -> Result<(), VerifyError> {
    for (idx, block) in unit.blocks.iter().enumerate() {
        let fail = |message: String| VerifyError {
            message: format!("unit `{}` block {idx}: {message}", unit.name),
        };
        if block.start_pc >= block.end_pc || block.end_pc > len {
            return Err(fail(format!(
                "invalid range {}..{} (len={len})",
                block.start_pc, block.end_pc
            )));
        }
        if let Some(parent) = block.parent {
            let Some(p) = unit.block(parent) else {
                return Err(fail(format!("parent id {} out of range", parent.0)));
            };
            if p.start_pc > block.start_pc || block.end_pc > p.end_pc {
                return Err(fail("range escapes parent block".to_string()));
            }
        }
        // Parent chains must terminate.
        let mut hops = 0usize;
        let mut cur = block.parent;
        while let Some(id) = cur {
            hops += 1;
            if hops > unit.blocks.len() {
                return Err(fail("parent chain forms a cycle".to_string()));
            }
            cur = unit.block(id).and_then(|b| b.parent);
        }
    }
    Ok(())
}
