use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::modules::Module;
use crate::planner::{Plan, Task};

pub const INIT_TASK: &str = "core.init";

const KNOWN_TABLES: &[&str] = &["workspace", "vendor", "manifest", "stage", "native"];

pub struct CoreModule;

impl Module for CoreModule {
    fn id(&self) -> &'static str {
        "core"
    }

    fn detect(&self, _doc: &ConfigDoc) -> bool {
        true
    }

    fn plan(&self, doc: &ConfigDoc, plan: &mut Plan) -> Result<()> {
        for key in doc.top_level_keys() {
            if !KNOWN_TABLES.contains(&key) {
                return Err(Error::msg(format!(
                    "config table '{}' is not supported; use {}",
                    key,
                    KNOWN_TABLES.join(", ")
                )));
            }
        }

        plan.add(Task {
            id: INIT_TASK.into(),
            label: "Init".into(),
            module: self.id().into(),
            phase: "init".into(),
            after: vec![],
            provides: vec!["core:initialized".into()],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_top_level_table_is_rejected() {
        let doc = ConfigDoc::parse_inline("vp.toml", "[build]\njobs = 4\n")
            .expect("parse");
        let mut plan = Plan::default();
        let err = CoreModule.plan(&doc, &mut plan).expect_err("unknown table");
        assert!(err.to_string().contains("'build'"), "{err}");
    }
}
