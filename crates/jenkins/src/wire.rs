//! Jenkins JSON payloads and their translation into the unified model.
//!
//! Only the fields requested through `tree=` queries are modelled; anything
//! else Jenkins sends is ignored.

use serde::Deserialize;

use hub::{
    Build, BuildNumber, BuildResult, Job, JobName, JobStatus, PipelineOverview, RemoteError, Stage,
    StageId, StageLog, StageStatus, Timestamp, View, ViewId,
};

/// `tree=` selector for job listings.
pub(crate) const JOB_TREE: &str = "name,fullName,color,lastBuild[number]";
/// `tree=` selector for the root view listing.
pub(crate) const VIEWS_TREE: &str = "views[name,description,jobs[name,fullName]]";
/// `tree=` selector for a single view.
pub(crate) const VIEW_TREE: &str =
    "name,description,jobs[name,fullName,color,lastBuild[number]]";
/// `tree=` selector for builds.
pub(crate) const BUILD_TREE: &str =
    "number,timestamp,result,building,previousBuild[number],nextBuild[number]";

#[derive(Debug, Deserialize)]
pub(crate) struct RootPayload {
    #[serde(default)]
    pub views: Vec<ViewPayload>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ViewPayload {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub jobs: Vec<JobPayload>,
}

impl ViewPayload {
    pub fn into_view(self) -> Result<View, RemoteError> {
        let id = ViewId::new(self.name.clone()).ok_or_else(|| malformed("view without a name"))?;
        let jobs = self
            .jobs
            .iter()
            .map(JobPayload::job_name)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(View {
            id,
            name: self.name,
            description: self.description.filter(|d| !d.is_empty()),
            jobs,
        })
    }

    pub fn into_jobs(self) -> Result<Vec<Job>, RemoteError> {
        self.jobs.into_iter().map(JobPayload::into_job).collect()
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct JobPayload {
    pub name: String,
    #[serde(rename = "fullName", default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(rename = "lastBuild", default)]
    pub last_build: Option<BuildRefPayload>,
}

impl JobPayload {
    fn job_name(&self) -> Result<JobName, RemoteError> {
        let name = self.full_name.as_deref().unwrap_or(&self.name);
        JobName::new(name).ok_or_else(|| malformed("job without a name"))
    }

    pub fn into_job(self) -> Result<Job, RemoteError> {
        Ok(Job {
            name: self.job_name()?,
            last_build_id: self.last_build.map(|b| BuildNumber::new(b.number)),
            status: self
                .color
                .as_deref()
                .map_or(JobStatus::Unknown, status_from_color),
        })
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct BuildRefPayload {
    pub number: u64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct BuildPayload {
    pub number: u64,
    pub timestamp: i64,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub building: bool,
    #[serde(rename = "previousBuild", default)]
    pub previous_build: Option<BuildRefPayload>,
    #[serde(rename = "nextBuild", default)]
    pub next_build: Option<BuildRefPayload>,
}

impl BuildPayload {
    pub fn into_build(self) -> Result<Build, RemoteError> {
        let started_at = Timestamp::from_unix_millis(self.timestamp)
            .ok_or_else(|| malformed("build timestamp out of range"))?;
        Ok(Build {
            id: BuildNumber::new(self.number),
            started_at,
            result: self.result.as_deref().and_then(result_from_str),
            building: self.building,
            previous_id: self.previous_build.map(|b| BuildNumber::new(b.number)),
            next_id: self.next_build.map(|b| BuildNumber::new(b.number)),
        })
    }
}

/// `wfapi/describe` payload of the Pipeline REST API.
#[derive(Debug, Deserialize)]
pub(crate) struct DescribePayload {
    pub status: String,
    #[serde(default)]
    pub stages: Vec<StagePayload>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct StagePayload {
    pub id: String,
    pub name: String,
    pub status: String,
    #[serde(rename = "durationMillis", default)]
    pub duration_millis: u64,
}

impl DescribePayload {
    pub fn into_overview(self, build: BuildNumber) -> Result<PipelineOverview, RemoteError> {
        let stages = self
            .stages
            .into_iter()
            .map(|s| {
                Ok(Stage {
                    id: StageId::new(s.id).ok_or_else(|| malformed("stage without an id"))?,
                    name: s.name,
                    status: stage_status_from_str(&s.status),
                    duration_millis: s.duration_millis,
                })
            })
            .collect::<Result<Vec<_>, RemoteError>>()?;
        Ok(PipelineOverview {
            build_id: build,
            status: stage_status_from_str(&self.status),
            stages,
        })
    }
}

/// `execution/node/{id}/wfapi/log` payload.
#[derive(Debug, Deserialize)]
pub(crate) struct StageLogPayload {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(rename = "hasMore", default)]
    pub has_more: bool,
    #[serde(default)]
    pub length: u64,
}

impl StageLogPayload {
    pub fn into_log(self, stage: StageId) -> StageLog {
        StageLog {
            stage_id: stage,
            text: self.text.unwrap_or_default(),
            has_more: self.has_more,
            length: self.length,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct CrumbPayload {
    pub crumb: String,
    #[serde(rename = "crumbRequestField")]
    pub crumb_request_field: String,
}

/// Maps a Jenkins ball colour onto a job status.
///
/// `_anime` suffixes mean a build is in progress whatever the base colour.
pub(crate) fn status_from_color(color: &str) -> JobStatus {
    if color.ends_with("_anime") {
        return JobStatus::Running;
    }
    match color {
        "blue" | "green" => JobStatus::Succeeded,
        "red" | "yellow" => JobStatus::Failed,
        "notbuilt" | "disabled" | "aborted" | "grey" => JobStatus::Idle,
        _ => JobStatus::Unknown,
    }
}

pub(crate) fn result_from_str(result: &str) -> Option<BuildResult> {
    match result {
        "SUCCESS" => Some(BuildResult::Success),
        "UNSTABLE" => Some(BuildResult::Unstable),
        "FAILURE" => Some(BuildResult::Failure),
        "NOT_BUILT" => Some(BuildResult::NotBuilt),
        "ABORTED" => Some(BuildResult::Aborted),
        _ => None,
    }
}

pub(crate) fn stage_status_from_str(status: &str) -> StageStatus {
    match status {
        "SUCCESS" => StageStatus::Success,
        "FAILED" => StageStatus::Failed,
        "UNSTABLE" => StageStatus::Unstable,
        "IN_PROGRESS" => StageStatus::InProgress,
        "PAUSED_PENDING_INPUT" => StageStatus::Paused,
        "ABORTED" => StageStatus::Aborted,
        "NOT_EXECUTED" => StageStatus::NotExecuted,
        _ => StageStatus::Unknown,
    }
}

pub(crate) fn malformed(message: impl Into<String>) -> RemoteError {
    RemoteError::Remote {
        code: 502,
        message: format!("malformed response: {}", message.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn animated_colours_mean_running() {
        assert_eq!(status_from_color("red_anime"), JobStatus::Running);
        assert_eq!(status_from_color("notbuilt_anime"), JobStatus::Running);
    }

    #[test]
    fn static_colours_map_to_outcomes() {
        assert_eq!(status_from_color("blue"), JobStatus::Succeeded);
        assert_eq!(status_from_color("yellow"), JobStatus::Failed);
        assert_eq!(status_from_color("disabled"), JobStatus::Idle);
        assert_eq!(status_from_color("purple"), JobStatus::Unknown);
    }

    #[test]
    fn job_without_colour_is_unknown_not_idle() {
        let payload: JobPayload = serde_json::from_str(r#"{"name":"deploy"}"#).unwrap();
        assert_eq!(payload.into_job().unwrap().status, JobStatus::Unknown);
    }

    #[test]
    fn folder_jobs_use_their_full_name() {
        let payload: JobPayload = serde_json::from_str(
            r#"{"name":"deploy","fullName":"team/deploy","color":"blue","lastBuild":{"number":12}}"#,
        )
        .unwrap();
        let job = payload.into_job().unwrap();
        assert_eq!(job.name.as_str(), "team/deploy");
        assert_eq!(job.last_build_id, Some(BuildNumber::new(12)));
    }

    #[test]
    fn running_build_has_no_result() {
        let payload: BuildPayload = serde_json::from_str(
            r#"{"number":4,"timestamp":1700000000000,"result":null,"building":true,
                "previousBuild":{"number":3},"nextBuild":null}"#,
        )
        .unwrap();
        let build = payload.into_build().unwrap();
        assert_eq!(build.result, None);
        assert!(!build.is_finished());
        assert_eq!(build.previous_id, Some(BuildNumber::new(3)));
        assert_eq!(build.next_id, None);
    }

    #[test]
    fn describe_payload_maps_stage_statuses() {
        let payload: DescribePayload = serde_json::from_str(
            r#"{"id":"7","status":"IN_PROGRESS","stages":[
                {"id":"6","name":"Build","status":"SUCCESS","durationMillis":1200},
                {"id":"14","name":"Deploy","status":"PAUSED_PENDING_INPUT","durationMillis":0}]}"#,
        )
        .unwrap();
        let overview = payload.into_overview(BuildNumber::new(7)).unwrap();
        assert_eq!(overview.status, StageStatus::InProgress);
        assert_eq!(overview.stages[0].status, StageStatus::Success);
        assert_eq!(overview.stages[1].status, StageStatus::Paused);
    }
}
