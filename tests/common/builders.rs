//! Builders for point definition records

/// Builder for one point definition line
pub struct RecordBuilder {
    names: Vec<String>,
    long_desc: String,
    units: String,
    source: String,
    inputs: Vec<String>,
    outputs: Vec<String>,
    translations: Vec<String>,
    limits: Vec<String>,
    archive: Vec<String>,
    period_secs: f64,
    notifications: Vec<String>,
    priority: Option<i32>,
}

impl RecordBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            names: vec![name.to_string()],
            long_desc: name.to_string(),
            units: "-".to_string(),
            source: "site".to_string(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            translations: Vec::new(),
            limits: Vec::new(),
            archive: Vec::new(),
            period_secs: 0.0,
            notifications: Vec::new(),
            priority: None,
        }
    }

    pub fn alias(mut self, alias: &str) -> Self {
        self.names.push(alias.to_string());
        self
    }

    pub fn source(mut self, source: &str) -> Self {
        self.source = source.to_string();
        self
    }

    pub fn units(mut self, units: &str) -> Self {
        self.units = units.to_string();
        self
    }

    pub fn input(mut self, spec: &str) -> Self {
        self.inputs.push(spec.to_string());
        self
    }

    pub fn output(mut self, spec: &str) -> Self {
        self.outputs.push(spec.to_string());
        self
    }

    pub fn stage(mut self, spec: &str) -> Self {
        self.translations.push(spec.to_string());
        self
    }

    pub fn limit(mut self, spec: &str) -> Self {
        self.limits.push(spec.to_string());
        self
    }

    pub fn archive(mut self, spec: &str) -> Self {
        self.archive.push(spec.to_string());
        self
    }

    pub fn period_secs(mut self, secs: f64) -> Self {
        self.period_secs = secs;
        self
    }

    pub fn notify(mut self, group: &str) -> Self {
        self.notifications.push(group.to_string());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn build(self) -> String {
        let period = (self.period_secs * 1_000_000.0) as i64;
        let mut line = format!(
            "{} \"{}\" \"{}\" {} {} T {} {} {} {} {} {} -",
            braced(&self.names),
            self.long_desc,
            self.long_desc,
            self.units,
            self.source,
            braced(&self.inputs),
            braced(&self.outputs),
            braced(&self.translations),
            braced(&self.limits),
            braced(&self.archive),
            period,
        );
        if let Some(priority) = self.priority {
            line.push_str(&format!(
                " {} {} \"Check {}\"",
                braced(&self.notifications),
                priority,
                self.long_desc
            ));
        }
        line
    }
}

fn braced(items: &[String]) -> String {
    match items.len() {
        0 => "-".to_string(),
        _ => format!("{{{}}}", items.join(",")),
    }
}

/// Join records into a definitions text
pub fn definitions(records: impl IntoIterator<Item = String>) -> String {
    let mut text = String::from("# generated by test builders\n");
    for record in records {
        text.push_str(&record);
        text.push('\n');
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_builder() {
        let line = RecordBuilder::new("temp")
            .alias("t")
            .units("C")
            .stage(r#"Mean-"60""#)
            .period_secs(10.0)
            .build();
        assert_eq!(
            line,
            r#"{temp,t} "temp" "temp" C site T - - {Mean-"60"} - - 10000000 -"#
        );
    }
}
