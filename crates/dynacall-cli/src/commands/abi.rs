//! ABI command - report a convention's register files and argument placement

use super::call::parse_kind;
use anyhow::{anyhow, Result};
use dynacall_runtime::{CallPlan, Convention, Location, Placement, Signature};

pub fn run(convention: Option<&str>, params: &[String], ret: Option<&str>, json: bool) -> Result<()> {
    let convention = match convention {
        Some(name) => name.parse::<Convention>().map_err(|e| anyhow!(e))?,
        None => Convention::host(),
    };
    let params = params
        .iter()
        .map(|p| parse_kind(p))
        .collect::<Result<Vec<_>>>()?;
    let ret = ret.map(parse_kind).transpose()?;
    let signature = Signature::new(params, ret);
    let plan = CallPlan::new(convention, &signature)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    println!("convention: {}", convention);
    if convention == Convention::host() {
        println!("host: yes");
    }
    println!(
        "registers: {} integer, {} float",
        convention.int_registers(),
        convention.float_registers()
    );
    println!("stack capacity: {} words", convention.max_stack_slots());

    if signature.params().is_empty() && signature.ret().is_none() {
        return Ok(());
    }

    println!("signature: {}", signature);
    for (i, (kind, placement)) in signature.params().iter().zip(plan.placements()).enumerate() {
        println!("  arg {} ({}): {}", i, kind, describe(placement));
    }
    println!("  return: {:?}", plan.return_class());
    let (ints, floats) = plan.registers_used();
    println!(
        "used: {} integer, {} float, {} stack",
        ints,
        floats,
        plan.stack_slots()
    );
    Ok(())
}

fn location(loc: &Location) -> String {
    match loc {
        Location::Int(i) => format!("int#{}", i),
        Location::Float(i) => format!("float#{}", i),
        Location::Stack(i) => format!("stack[{}]", i),
    }
}

fn describe(placement: &Placement) -> String {
    match placement {
        Placement::Scalar(loc) => location(loc),
        Placement::Indirect(loc) => format!("by reference in {}", location(loc)),
        Placement::Pieces(pieces) => pieces
            .iter()
            .map(|piece| {
                format!(
                    "bytes {}..{} in {}",
                    piece.offset,
                    piece.offset + piece.size,
                    location(&piece.loc)
                )
            })
            .collect::<Vec<_>>()
            .join(", "),
        Placement::Empty => "nothing".to_string(),
    }
}
