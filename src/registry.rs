//! Reference data: products, devices, company and user profiles, signatures

use std::collections::HashSet;

use crate::context::Context;
use crate::devices;
use crate::error::{AppError, AppResult};
use crate::models::{Company, Device, Product, Signature, UserData};
use crate::store::{self, Collection, DOCUMENT_ID, NewTask, now_rfc3339};


#[derive(Clone)]
pub struct Products {
    ctx: Context,
}

impl Products {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Sorted by name
    pub fn list(&self) -> AppResult<Vec<Product>> {
        let mut products: Vec<Product> = self.ctx.load(Collection::Products)?;
        products.sort_by_key(|p| p.name.to_lowercase());
        Ok(products)
    }

    pub fn get(&self, id: &str) -> AppResult<Product> {
        self.ctx
            .find(Collection::Products, id)?
            .ok_or_else(|| AppError::not_found("Produto", id))
    }

    pub fn create(&self, input: Product) -> AppResult<Product> {
        validate_product(&input)?;
        let _guard = self.ctx.write()?;

        let now = now_rfc3339();
        let product = Product {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: now.clone(),
            updated_at: now,
            ..input
        };
        self.ctx.save_record(Collection::Products, &product)?;
        tracing::info!(product_id = %product.id, name = %product.name, "Product created");
        Ok(product)
    }

    pub fn update(&self, id: &str, input: Product) -> AppResult<Product> {
        validate_product(&input)?;
        let _guard = self.ctx.write()?;

        let existing = self.get(id)?;
        let product = Product {
            id: existing.id,
            created_at: existing.created_at,
            updated_at: now_rfc3339(),
            ..input
        };
        self.ctx.save_record(Collection::Products, &product)?;
        Ok(product)
    }

    pub fn delete(&self, id: &str) -> AppResult<()> {
        let _guard = self.ctx.write()?;
        if !self.ctx.delete_record::<Product>(Collection::Products, id)? {
            return Err(AppError::not_found("Produto", id));
        }
        Ok(())
    }
}

fn validate_product(input: &Product) -> AppResult<()> {
    if input.name.trim().is_empty() {
        return Err(AppError::Validation("Informe o nome do produto".into()));
    }
    Ok(())
}

/// The device inventory of the current service site
#[derive(Clone)]
pub struct Devices {
    ctx: Context,
}

impl Devices {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    pub fn list(&self) -> AppResult<Vec<Device>> {
        self.ctx.load(Collection::Devices)
    }

    pub fn selectable(&self) -> AppResult<Vec<Device>> {
        Ok(devices::selectable_devices(&self.list()?))
    }

    /// Replaces the whole inventory; removed ids are deleted remotely
    pub fn replace(&self, devices: Vec<Device>) -> AppResult<Vec<Device>> {
        let mut seen = HashSet::new();
        if let Some(dup) = devices.iter().find(|d| !seen.insert(d.id)) {
            return Err(AppError::Validation(format!(
                "Dispositivo {} informado mais de uma vez",
                dup.id
            )));
        }

        let _guard = self.ctx.write()?;
        let previous: Vec<Device> = self.ctx.load(Collection::Devices)?;
        store::save_list(self.ctx.store.as_ref(), Collection::Devices, &devices)?;

        for removed in previous.iter().filter(|p| !seen.contains(&p.id)) {
            self.ctx
                .record_change(NewTask::delete(Collection::Devices, &removed.id.to_string()))?;
        }
        for device in devices.iter().filter(|d| !previous.contains(d)) {
            self.ctx.record_change(NewTask::upsert(
                Collection::Devices,
                &device.id.to_string(),
                device,
            )?)?;
        }

        tracing::info!(count = devices.len(), "Device inventory replaced");
        Ok(devices)
    }
}

/// Company and user profile documents
#[derive(Clone)]
pub struct Profiles {
    ctx: Context,
}

impl Profiles {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    pub fn company(&self) -> AppResult<Company> {
        Ok(store::load_document(self.ctx.store.as_ref(), Collection::Company)?.unwrap_or_default())
    }

    pub fn save_company(&self, company: Company) -> AppResult<Company> {
        if company.name.trim().is_empty() {
            return Err(AppError::Validation("Informe o nome da empresa".into()));
        }
        let company = Company {
            id: document_id(&company.id),
            updated_at: now_rfc3339(),
            ..company
        };
        self.save_document(Collection::Company, &company.id, &company)?;
        Ok(company)
    }

    pub fn user(&self) -> AppResult<UserData> {
        Ok(store::load_document(self.ctx.store.as_ref(), Collection::UserData)?.unwrap_or_default())
    }

    pub fn save_user(&self, user: UserData) -> AppResult<UserData> {
        let user = UserData {
            id: document_id(&user.id),
            updated_at: now_rfc3339(),
            ..user
        };
        self.save_document(Collection::UserData, &user.id, &user)?;
        Ok(user)
    }

    fn save_document<T: serde::Serialize>(&self, collection: Collection, id: &str, doc: &T) -> AppResult<()> {
        let _guard = self.ctx.write()?;
        store::save_document(self.ctx.store.as_ref(), collection, doc)?;
        self.ctx.record_change(NewTask::upsert(collection, id, doc)?)
    }
}

fn document_id(id: &str) -> String {
    if id.trim().is_empty() {
        DOCUMENT_ID.to_string()
    } else {
        id.to_string()
    }
}

/// Stored signature images, one per signature type
#[derive(Clone)]
pub struct Signatures {
    ctx: Context,
}

impl Signatures {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    pub fn list(&self) -> AppResult<Vec<Signature>> {
        self.ctx.load(Collection::Signatures)
    }

    /// The signature type doubles as the record id
    pub fn save(&self, signature: Signature) -> AppResult<Signature> {
        let signature_type = signature.signature_type.trim().to_string();
        if signature_type.is_empty() {
            return Err(AppError::Validation("Informe o tipo de assinatura".into()));
        }
        let signature = Signature {
            id: signature_type.clone(),
            signature_type,
            updated_at: now_rfc3339(),
            ..signature
        };

        let _guard = self.ctx.write()?;
        self.ctx.save_record(Collection::Signatures, &signature)?;
        Ok(signature)
    }
}
