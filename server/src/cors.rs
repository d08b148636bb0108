use rocket::{
  fairing::{Fairing, Info, Kind},
  http::{Header, Status},
  Request, Response,
};

pub struct CORS;

#[rocket::async_trait]
impl Fairing for CORS {
  fn info(&self) -> Info {
    Info {
      name: "Add CORS headers to responses",
      kind: Kind::Response,
    }
  }

  async fn on_response<'r>(&self, _request: &'r Request<'_>, response: &mut Response<'r>) {
    response.set_header(Header::new("Access-Control-Allow-Origin", "*"));
    response.set_header(Header::new("Access-Control-Allow-Headers", "Content-Type"));
    response.set_header(Header::new("Access-Control-Allow-Methods", "GET, POST, OPTIONS"));
  }
}

#[rocket::options("/<_..>")]
pub fn all_options() -> Status {
  Status::NoContent
}
