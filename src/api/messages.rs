use actix_web::{post, web, Responder, Scope};

use crate::error::Error;
use crate::message::Message;
use crate::service::Service;

#[post("")]
async fn submit(
    service: web::Data<Service>,
    body: web::Json<Message>,
) -> Result<impl Responder, Error> {
    let receipt = service.submit(body.into_inner()).await?;

    Ok(web::Json(receipt))
}

pub fn service() -> Scope {
    web::scope("/messages").service(submit)
}
