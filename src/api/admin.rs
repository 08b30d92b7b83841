use actix_web::{delete, get, post, web, Responder, Scope};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::job::{JobRecord, JobState};
use crate::service::{Service, DEFAULT_LIST_LIMIT};

#[get("")]
async fn stats(service: web::Data<Service>) -> Result<impl Responder, Error> {
    let stats = service.stats().await?;

    Ok(web::Json(stats))
}

#[derive(Debug, Deserialize)]
struct ListMainQuery {
    state: Option<JobState>,
    offset: Option<i64>,
    limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ListDeadLetterQuery {
    offset: Option<i64>,
    limit: Option<i64>,
}

#[derive(Serialize)]
struct ListJobsResponse {
    jobs: Vec<JobRecord>,
}

#[get("/main")]
async fn list_main(
    service: web::Data<Service>,
    query: web::Query<ListMainQuery>,
) -> Result<impl Responder, Error> {
    let jobs = service
        .list_main(
            query.state,
            query.offset.unwrap_or(0),
            query.limit.unwrap_or(DEFAULT_LIST_LIMIT),
        )
        .await?;

    Ok(web::Json(ListJobsResponse { jobs }))
}

#[get("/dead-letter")]
async fn list_dead_letter(
    service: web::Data<Service>,
    query: web::Query<ListDeadLetterQuery>,
) -> Result<impl Responder, Error> {
    let jobs = service
        .list_dead_letter(
            query.offset.unwrap_or(0),
            query.limit.unwrap_or(DEFAULT_LIST_LIMIT),
        )
        .await?;

    Ok(web::Json(ListJobsResponse { jobs }))
}

#[get("/{job_id}")]
async fn get_job(
    service: web::Data<Service>,
    path: web::Path<i64>,
) -> Result<impl Responder, Error> {
    let job = service.get(*path).await?;

    Ok(web::Json(job))
}

#[post("/{job_id}/requeue")]
async fn requeue(
    service: web::Data<Service>,
    path: web::Path<i64>,
) -> Result<impl Responder, Error> {
    let receipt = service.requeue(*path).await?;

    Ok(web::Json(receipt))
}

#[delete("/{job_id}")]
async fn remove_job(
    service: web::Data<Service>,
    path: web::Path<i64>,
) -> Result<impl Responder, Error> {
    service.remove(*path).await?;

    Ok("OK")
}

pub fn stats_service() -> Scope {
    web::scope("/stats").service(stats)
}

pub fn jobs_service() -> Scope {
    web::scope("/jobs")
        .service(list_main)
        .service(list_dead_letter)
        .service(get_job)
        .service(requeue)
        .service(remove_job)
}
