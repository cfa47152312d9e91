use crate::reconciler::Field;

pub const TOPIC_SUFFIX_ONLINE: &str = "online";
pub const TOPIC_SUFFIX_TELEMETRY: &str = "telemetry";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadTopics {
    base: String,
}

impl HeadTopics {
    pub fn new(team_id: &str, light_id: &str) -> Self {
        Self {
            base: format!("traffic/teams/{team_id}/traffic_lights/{light_id}"),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn field(&self, field: Field) -> String {
        format!("{}/{}", self.base, field.key())
    }

    pub fn subscriptions(&self) -> Vec<String> {
        std::iter::once(self.base.clone())
            .chain(Field::ALL.iter().map(|field| self.field(*field)))
            .collect()
    }

    pub fn online(&self) -> String {
        format!("{}/{TOPIC_SUFFIX_ONLINE}", self.base)
    }

    pub fn telemetry(&self) -> String {
        format!("{}/{TOPIC_SUFFIX_TELEMETRY}", self.base)
    }

    pub fn relative_path<'a>(&self, topic: &'a str) -> Option<&'a str> {
        let rest = topic.strip_prefix(self.base.as_str())?;
        if rest.is_empty() {
            return Some("/");
        }
        rest.starts_with('/').then_some(rest)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn builds_head_topics() {
        let topics = HeadTopics::new("10", "3");

        assert_eq!(topics.base(), "traffic/teams/10/traffic_lights/3");
        assert_eq!(
            topics.field(Field::RemainingTime),
            "traffic/teams/10/traffic_lights/3/remaintime"
        );
        assert_eq!(topics.online(), "traffic/teams/10/traffic_lights/3/online");
        assert_eq!(
            topics.subscriptions(),
            vec![
                "traffic/teams/10/traffic_lights/3".to_string(),
                "traffic/teams/10/traffic_lights/3/color".to_string(),
                "traffic/teams/10/traffic_lights/3/remaintime".to_string(),
                "traffic/teams/10/traffic_lights/3/yellow_duration".to_string(),
                "traffic/teams/10/traffic_lights/3/status".to_string(),
            ]
        );
    }

    #[test]
    fn strips_base_from_incoming_topics() {
        let topics = HeadTopics::new("10", "3");

        assert_eq!(
            topics.relative_path("traffic/teams/10/traffic_lights/3/color"),
            Some("/color")
        );
        assert_eq!(
            topics.relative_path("traffic/teams/10/traffic_lights/3"),
            Some("/")
        );
        assert_eq!(
            topics.relative_path("traffic/teams/10/traffic_lights/30/color"),
            None
        );
        assert_eq!(topics.relative_path("traffic/teams/11/traffic_lights/3"), None);
    }
}
