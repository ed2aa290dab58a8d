use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::job::Job;

/// Parsed scheduler configuration: named jobs, each with a task and its
/// schedules.
#[derive(Default, Debug)]
pub struct Configuration {
    pub jobs: BTreeMap<String, Arc<Job>>,
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, job) in &self.jobs {
            writeln!(f, "job {name:?}")?;
            writeln!(f, "   {}", job.task)?;
            for schedule in &job.schedules {
                writeln!(f, "     {schedule}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::parser::parse_config;

    #[test]
    fn display_lists_jobs_in_name_order() {
        let config = parse_config(
            r#"
            job "b" check @r at 01:00
            job "a" maintenance @r every 2h on mon
            "#,
        )
        .unwrap();
        let rendered = config.to_string();
        let a = rendered.find("job \"a\"").unwrap();
        let b = rendered.find("job \"b\"").unwrap();
        assert!(a < b);
        assert!(rendered.contains("every 7200s"));
        assert!(rendered.contains("on monday"));
    }
}
