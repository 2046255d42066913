//!
//! Built-in R7.3 pore models, used when none are supplied.
//!
use crate::error::Result;
use crate::model::{ModelDict, PoreModel, STRAND_COMPLEMENT, STRAND_TEMPLATE};
use log::info;
use std::io::Cursor;
use std::path::Path;

pub struct BuiltinModel {
    pub name: &'static str,
    pub strand: u8,
    pub table: &'static str,
}

pub const BUILTIN_MODELS: [BuiltinModel; 3] = [
    BuiltinModel {
        name: "r7.3_template_median68pA",
        strand: STRAND_TEMPLATE,
        table: include_str!("../data/r7.3_template_median68pA.model"),
    },
    BuiltinModel {
        name: "r7.3_complement_median68pA_pop1",
        strand: STRAND_COMPLEMENT,
        table: include_str!("../data/r7.3_complement_median68pA_pop1.model"),
    },
    BuiltinModel {
        name: "r7.3_complement_median68pA_pop2",
        strand: STRAND_COMPLEMENT,
        table: include_str!("../data/r7.3_complement_median68pA_pop2.model"),
    },
];

pub fn load_builtin_models() -> Result<ModelDict> {
    let mut models = ModelDict::new();
    for b in BUILTIN_MODELS.iter() {
        let mut pm = PoreModel::load(Cursor::new(b.table), Path::new(b.name))?;
        pm.set_strand(b.strand);
        info!(
            "loaded builtin model [{}] for strand [{}] statistics [mean={:.2}, stdv={:.2}]",
            b.name,
            b.strand,
            pm.mean(),
            pm.stdv()
        );
        models.insert(b.name.to_string(), pm);
    }
    Ok(models)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_models_parse() {
        let models = load_builtin_models().unwrap();
        assert_eq!(models.len(), 3);
        for (name, pm) in models.iter() {
            assert_eq!(pm.k(), 6, "{}", name);
            assert_eq!(pm.n_states(), 4096);
            assert!(pm.with_sd());
            assert!(pm.mean() > 40.0 && pm.mean() < 120.0);
        }
        let tmpl = &models["r7.3_template_median68pA"];
        assert!(tmpl.applies_to(0));
        assert!(!tmpl.applies_to(1));
    }
}
