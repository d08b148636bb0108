use rocket::{
  fairing::AdHoc,
  figment::Figment,
  http::{ContentType, Header, Status},
  serde::json::{json, Json, Value},
  Build, Rocket, State,
};
use study_data::{answers::ParticipantId, store, study::UNKNOWN_FORM, Study, StudyConfig};

mod cors;

type Failure = (Status, Json<Value>);
type ApiResult = Result<Json<Value>, Failure>;

fn failure(status: Status, message: impl std::fmt::Display) -> Failure {
  (status, Json(json!({ "message": message.to_string() })))
}

fn internal(err: anyhow::Error) -> Failure {
  log::error!("{err:?}");
  failure(Status::InternalServerError, err)
}

fn success() -> Json<Value> {
  Json(json!({ "status": "success" }))
}

fn participant(userid: Option<&str>) -> Result<ParticipantId, Failure> {
  match userid {
    Some(userid) if !userid.trim().is_empty() => {
      ParticipantId::new(userid).map_err(|e| failure(Status::BadRequest, e))
    }
    _ => Err(failure(Status::BadRequest, "userid must not be empty")),
  }
}

fn body_userid(body: &Value) -> Option<&str> {
  body
    .get("userid")
    .and_then(Value::as_str)
    .filter(|userid| !userid.trim().is_empty())
}

#[rocket::get("/")]
fn index() -> &'static str {
  "STUDY BACKEND"
}

#[rocket::post("/register")]
fn register(study: &State<Study>) -> ApiResult {
  let id = study.register().map_err(internal)?;
  Ok(Json(json!({ "userid": id })))
}

// Malformed or anonymous submissions are acknowledged and dropped.
#[rocket::post("/submit-form", format = "json", data = "<data>")]
fn submit_form(data: Option<Json<Value>>, study: &State<Study>) -> ApiResult {
  let Some(Json(body)) = data else {
    return Ok(success());
  };
  let Some(userid) = body_userid(&body) else {
    return Ok(success());
  };
  let id = participant(Some(userid))?;
  let form_key = body
    .get("form_key")
    .and_then(Value::as_str)
    .filter(|key| !key.is_empty())
    .unwrap_or(UNKNOWN_FORM)
    .to_string();
  store::validate_form_key(&form_key).map_err(|e| failure(Status::BadRequest, e))?;
  study.record_submission(&id, &form_key, body).map_err(internal)?;
  Ok(success())
}

#[rocket::post("/lesson-complete", format = "json", data = "<data>")]
fn lesson_complete(data: Option<Json<Value>>, study: &State<Study>) -> ApiResult {
  let Some(Json(body)) = data else {
    return Ok(success());
  };
  let Some(userid) = body_userid(&body) else {
    return Ok(success());
  };
  let id = participant(Some(userid))?;
  study.record_lesson(&id, body).map_err(internal)?;
  Ok(success())
}

#[rocket::get("/group?<userid>")]
fn group(userid: Option<&str>, study: &State<Study>) -> ApiResult {
  let id = participant(userid)?;
  let group = study.assign(&id).map_err(internal)?;
  Ok(Json(json!({ "group": group })))
}

#[rocket::get("/completion?<userid>")]
fn completion(userid: Option<&str>, study: &State<Study>) -> ApiResult {
  let id = participant(userid)?;
  study.store().ensure_participant(&id).map_err(internal)?;
  Ok(Json(json!({ "completed": study.completion(&id) })))
}

#[rocket::post("/completion", format = "json", data = "<data>")]
fn set_completion(data: Option<Json<Value>>, study: &State<Study>) -> ApiResult {
  let Some(Json(body)) = data else {
    return Ok(success());
  };
  let id = participant(body.get("userid").and_then(Value::as_str))?;
  let completed = body.get("completed").map(store::is_truthy).unwrap_or(true);
  study.set_completion(&id, completed).map_err(internal)?;
  Ok(Json(json!({ "status": "success", "completed": completed })))
}

#[derive(rocket::Responder)]
struct LedgerDownload {
  inner: Vec<u8>,
  content_type: ContentType,
  disposition: Header<'static>,
}

#[rocket::get("/user-record")]
fn user_record(study: &State<Study>) -> Result<LedgerDownload, Failure> {
  match study.export_ledger().map_err(internal)? {
    Some(bytes) => Ok(LedgerDownload {
      inner: bytes,
      content_type: ContentType::new("text", "tab-separated-values")
        .with_params(("charset", "utf-8")),
      disposition: Header::new(
        "Content-Disposition",
        "attachment; filename=\"user_record.tsv\"",
      ),
    }),
    None => Err(failure(Status::NotFound, "ledger file does not exist")),
  }
}

fn build(figment: Figment) -> Rocket<Build> {
  rocket::custom(figment)
    .attach(cors::CORS)
    .attach(AdHoc::try_on_ignite("Study data", |rocket| async move {
      let extracted = rocket.figment().extract_inner::<StudyConfig>("study");
      let config = match extracted {
        Ok(config) => config,
        Err(e) if e.missing() => StudyConfig::default(),
        Err(e) => {
          log::error!("Invalid study configuration: {e}");
          return Err(rocket);
        }
      };
      match Study::open(&config) {
        Ok(study) => Ok(rocket.manage(study)),
        Err(e) => {
          log::error!("Failed to open {}: {e:?}", config.data_dir.display());
          Err(rocket)
        }
      }
    }))
    .mount(
      "/",
      rocket::routes![
        index,
        register,
        submit_form,
        lesson_complete,
        group,
        completion,
        set_completion,
        user_record,
        cors::all_options
      ],
    )
}

#[rocket::launch]
fn rocket() -> _ {
  build(rocket::Config::figment())
}

#[cfg(test)]
mod tests {
  use super::*;
  use rocket::local::blocking::Client;
  use tempfile::TempDir;

  fn client(dir: &TempDir) -> Client {
    let figment = rocket::Config::figment().merge(("study.data_dir", dir.path()));
    Client::tracked(build(figment)).unwrap()
  }

  fn post_json(client: &Client, uri: &'static str, body: Value) -> Value {
    let response = client
      .post(uri)
      .header(ContentType::JSON)
      .body(body.to_string())
      .dispatch();
    assert_eq!(response.status(), Status::Ok, "{uri}");
    response.into_json().unwrap()
  }

  #[test]
  fn participant_flow() {
    let dir = TempDir::new().unwrap();
    let client = client(&dir);

    let registered = post_json(&client, "/register", json!({}));
    let userid = registered["userid"].as_str().unwrap().to_string();
    assert_eq!(userid.len(), 16);

    let response = client.get(format!("/group?userid={userid}")).dispatch();
    assert_eq!(response.into_json::<Value>().unwrap(), json!({ "group": "group1" }));

    let submitted = post_json(
      &client,
      "/submit-form",
      json!({
        "userid": userid,
        "form_key": "post6_1",
        "answers": [{ "index": 1, "selected_choice": ["A", "B", "C", "D"] }],
      }),
    );
    assert_eq!(submitted, json!({ "status": "success" }));
    post_json(&client, "/lesson-complete", json!({ "userid": userid, "duration_ms": 5000 }));

    let response = client.get(format!("/completion?userid={userid}")).dispatch();
    assert_eq!(response.into_json::<Value>().unwrap(), json!({ "completed": false }));

    let completed = post_json(&client, "/completion", json!({ "userid": userid }));
    assert_eq!(completed, json!({ "status": "success", "completed": true }));
    let response = client.get(format!("/completion?userid={userid}")).dispatch();
    assert_eq!(response.into_json::<Value>().unwrap(), json!({ "completed": true }));

    let response = client.get("/user-record").dispatch();
    assert_eq!(response.status(), Status::Ok);
    assert_eq!(
      response.headers().get_one("Content-Disposition"),
      Some("attachment; filename=\"user_record.tsv\"")
    );
    let tsv = response.into_string().unwrap();
    let mut lines = tsv.lines();
    assert!(lines.next().unwrap().starts_with("userid\tgroup\tlesson-duration_seconds"));
    let row = lines.next().unwrap();
    assert!(row.starts_with(&format!("{userid}\tgroup1\t5\t")));
    assert!(lines.next().is_none());
  }

  #[test]
  fn missing_userid_is_rejected() {
    let dir = TempDir::new().unwrap();
    let client = client(&dir);
    assert_eq!(client.get("/group").dispatch().status(), Status::BadRequest);
    assert_eq!(client.get("/completion?userid=").dispatch().status(), Status::BadRequest);
    let response = client
      .post("/completion")
      .header(ContentType::JSON)
      .body("{}")
      .dispatch();
    assert_eq!(response.status(), Status::BadRequest);
  }

  #[test]
  fn malformed_submissions_are_acknowledged() {
    let dir = TempDir::new().unwrap();
    let client = client(&dir);
    let response = client
      .post("/submit-form")
      .header(ContentType::JSON)
      .body("not json")
      .dispatch();
    assert_eq!(response.status(), Status::Ok);
    assert_eq!(post_json(&client, "/submit-form", json!({ "form_key": "pre2" }))["status"], "success");
    assert!(fs_entries(&dir).is_empty());
  }

  fn fs_entries(dir: &TempDir) -> Vec<String> {
    std::fs::read_dir(dir.path())
      .unwrap()
      .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
      .filter(|name| name != "user_record.tsv")
      .collect()
  }

  #[test]
  fn preflight_gets_cors_headers() {
    let dir = TempDir::new().unwrap();
    let client = client(&dir);
    let response = client.options("/submit-form").dispatch();
    assert_eq!(response.status(), Status::NoContent);
    assert_eq!(response.headers().get_one("Access-Control-Allow-Origin"), Some("*"));
  }
}
