use crate::config::Credentials;
use actix_web::{
    Error, FromRequest, HttpResponse,
    body::EitherBody,
    dev::{Service, ServiceRequest, ServiceResponse, Transform, forward_ready},
    web::Data,
};
use actix_web_httpauth::extractors::basic::BasicAuth;
use log::{error, warn};
use std::{
    future::{Future, Ready, ready},
    marker::PhantomData,
    pin::Pin,
    rc::Rc,
};

type LocalBoxFuture<T> = Pin<Box<dyn Future<Output = T> + 'static>>;

/// Rejects requests without the configured Basic auth credentials
pub struct AuthMw;

impl<S, B> Transform<S, ServiceRequest> for AuthMw
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type InitError = ();
    type Transform = AuthMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(AuthMiddleware {
            service: Rc::new(service),
        }))
    }
}

pub struct AuthMiddleware<S> {
    service: Rc<S>,
}

impl<S, B> Service<ServiceRequest> for AuthMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();

        Box::pin(async move {
            let Some(credentials) = req.app_data::<Data<Credentials>>().cloned() else {
                error!("credentials missing from app data");
                let http_res = HttpResponse::InternalServerError().finish();
                let (http_req, _) = req.into_parts();
                return Ok(ServiceResponse::new(http_req, http_res).map_into_right_body());
            };

            let Ok(auth) = BasicAuth::extract(req.request()).await else {
                return Ok(forbidden(req).map_into_right_body());
            };

            if verify_user(&auth, &credentials) {
                let res = service.call(req).await?;
                Ok(res.map_into_left_body())
            } else {
                warn!("rejected credentials for user {:?}", auth.user_id());
                Ok(forbidden(req).map_into_right_body())
            }
        })
    }
}

fn verify_user(auth: &BasicAuth, credentials: &Credentials) -> bool {
    auth.user_id() == credentials.user && auth.password() == Some(credentials.password.as_str())
}

fn forbidden(req: ServiceRequest) -> ServiceResponse {
    let http_res = HttpResponse::Forbidden().body("Forbidden");
    let (http_req, _) = req.into_parts();
    ServiceResponse::new(http_req, http_res)
}

/// Notified about every request that reaches a handler
pub trait ActivityObserver {
    fn request_received(&self);
}

/// Reports requests to the `T` registered as app data
pub struct ActivityMw<T>(PhantomData<T>);

impl<T> Default for ActivityMw<T> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<S, B, T> Transform<S, ServiceRequest> for ActivityMw<T>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
    T: ActivityObserver + 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = ActivityMiddleware<S, T>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(ActivityMiddleware {
            service: Rc::new(service),
            observer: PhantomData,
        }))
    }
}

pub struct ActivityMiddleware<S, T> {
    service: Rc<S>,
    observer: PhantomData<T>,
}

impl<S, B, T> Service<ServiceRequest> for ActivityMiddleware<S, T>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
    T: ActivityObserver + 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        match req.app_data::<Data<T>>() {
            Some(observer) => observer.request_received(),
            None => error!("activity observer missing from app data"),
        }

        Box::pin(self.service.call(req))
    }
}
